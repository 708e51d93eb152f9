//! Provider-agnostic chat gateway: OpenAI, Anthropic and Google behind one
//! request shape, plus the client-side conversation controller and session store.

pub mod adapter;
pub mod config;
pub mod controller;
pub mod dispatcher;
pub mod error;
pub mod http;
pub mod remote;
pub mod server;
pub mod session;
pub mod stream;
pub mod types;

pub use adapter::{
    AnthropicMessagesAdapter, DynAdapter, GoogleGeminiAdapter, OpenAiChatAdapter, ProviderAdapter,
};
pub use config::{GatewayConfig, ProviderConfig, build_dispatcher_from_config};
pub use controller::{
    ConversationController, ConversationEvent, SendRejected, TitleSettings, TurnOutcome, TurnState,
};
pub use dispatcher::{Dispatcher, DynGateway, Gateway};
pub use error::GatewayError;
pub use remote::RemoteGateway;
pub use session::{FileStore, KeyValueStore, MemoryStore, Session, SessionStore};
pub use types::*;
