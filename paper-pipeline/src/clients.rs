pub mod format;
pub mod summarizer;
pub mod telegram;

pub use format::{PostContent, build_post};
pub use summarizer::{GeneratedSummary, OpenAiSummarizer, Summarizer, SummaryInput};
pub use telegram::{DeliveryAdapter, TelegramClient};
