//! Message composition helpers shared by single and bulk sends.

pub mod bulk;
pub mod recipient;
pub mod template;

pub use bulk::{BulkOutcome, BulkReport, OutgoingMessage};
pub use recipient::{normalize_recipient, WHATSAPP_USER_SUFFIX};
pub use template::render_template;
