//! 工具层：后端抽象、工具目录、调用归一化与并发执行

pub mod backend;
pub mod catalog;
pub mod clock;
pub mod echo;
pub mod executor;
pub mod identifier;
pub mod mock;
pub mod normalizer;
pub mod registry;
pub mod schema;

pub use backend::{
    BackendConnector, PromptArgument, PromptDescriptor, PromptMessage, ResourceDescriptor, ToolBackend,
    ToolDescriptor, ToolOutcome, ToolResult,
};
pub use catalog::{to_function_spec, CatalogEntry, ToolCatalog};
pub use clock::ClockTool;
pub use echo::EchoTool;
pub use executor::{ToolExecutor, DEFAULT_TOOL_TIMEOUT_SECS};
pub use identifier::ToolIdentifier;
pub use mock::{MockBackend, MockBehavior};
pub use normalizer::{normalize_arguments, ToolCallNormalizer, ToolInvocation};
pub use registry::{LocalBackend, Tool, ToolRegistry, LOCAL_BACKEND};
