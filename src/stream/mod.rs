//! 流式响应组装：把交错、分片的增量记录还原为完整的文本、推理与工具调用

pub mod assembler;
pub mod delta;

pub use assembler::{
    assemble_stream, AssembledResponse, AssembledToolCall, ReasoningFragment, StreamAssembler,
};
