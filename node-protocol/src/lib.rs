//! Wire types shared by `llm-node`'s HTTP surface and its router client.

pub mod audio;
pub mod capability;
pub mod chat;
pub mod completion;
pub mod embeddings;
pub mod images;
pub mod model;
pub mod router;

pub use capability::{Capability, CapabilityInfo, CapabilityStatus};
pub use chat::{
    ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse, ChatMessage, Choice,
    MessageContent, StopSequences, ToolCall, ToolFunction, Usage,
};
pub use completion::{CompletionRequest, CompletionResponse};
pub use embeddings::{EmbeddingsRequest, EmbeddingsResponse};
pub use model::{ModelData, ModelDescriptor, ModelsResponse};
pub use router::{
    LoadedModels, ModelCatalog, NodeHealth, NodeHealthReport, NodeRegistration, NodeRegistrationResponse,
};
