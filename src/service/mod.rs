//! Entry points called when templates change.

mod templates;

pub use templates::{TemplateError, TemplateService};
