//! Reply generation implementations.

pub mod chat;
pub mod mock;

use std::sync::Arc;

use crate::config::Config;
use crate::voice::provider::ReplyGenerator;

pub fn create_reply_generator(config: &Config) -> Arc<dyn ReplyGenerator> {
    Arc::new(chat::ChatCompletionsGenerator::new(config.chat.clone()))
}
