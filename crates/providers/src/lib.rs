//! LLM provider adapters and the forgiving output parser.
//!
//! Every stage call goes through the [`LlmProvider`] trait; the only
//! shipping adapter speaks the OpenAI chat-completions wire format. The
//! role table maps REFLEX/MIND/VOICE/NERVES onto (model, temperature).

pub mod openai_compat;
pub mod parse;
pub mod roles;
pub mod traits;

pub use openai_compat::OpenAiCompatProvider;
pub use roles::RoleRouter;
pub use traits::{
    ChatMessage, ChatRequest, ChatResponse, EmbeddingsRequest, EmbeddingsResponse, LlmProvider,
    MsgRole, Usage,
};
