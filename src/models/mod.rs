pub mod queue;

pub use queue::{EmailTemplate, QueueItem, TemplateKind};
