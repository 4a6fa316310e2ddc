/// Addressing suffix of individual WhatsApp users.
pub const WHATSAPP_USER_SUFFIX: &str = "@c.us";

/// Turns a free-form phone number into a chat id.
///
/// Every non-digit character is dropped (including a suffix the caller may
/// already have added) and the suffix is appended exactly once. Returns
/// `None` when no digits remain.
pub fn normalize_recipient(to: &str) -> Option<String> {
    let digits: String = to
        .chars()
        .filter(char::is_ascii_digit)
        .collect();

    if digits.is_empty() {
        return None;
    }
    Some(format!("{}{}", digits, WHATSAPP_USER_SUFFIX))
}
