//! Conversational wrapper around a LLaVA-style vision-language model.
//!
//! The crate glues a pretrained checkpoint (vision encoder, multimodal
//! projector, causal language model — all loaded through candle) to a
//! templated chat flow: one image is fetched and preprocessed at
//! construction, each call renders the role-tagged history into a prompt,
//! generation streams live tokens to a sink, and the decoded reply is
//! appended to the returned history.
//!
//! ```no_run
//! use colloquy::{Message, Pipeline, PipelineConfig};
//!
//! let config = PipelineConfig::new("llava-hf/llava-v1.6-vicuna-7b-hf", "scene.jpg");
//! let mut pipeline = Pipeline::load(&config)?;
//! let history = pipeline.call(&[Message::user("What's in the image?")])?;
//! println!("{}", history.last().map(|m| m.content.as_str()).unwrap_or(""));
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! Custom backends implement [`VlmModel`]; the pipeline is generic over it.

pub mod constants;
pub mod conversation;
pub mod image;
pub mod llava;
pub mod model;
pub mod pipeline;
pub mod stream;

pub use conversation::{Conversation, Message, ROLE_ASSISTANT, ROLE_USER, SeparatorStyle};
pub use llava::{CandleLlava, LlavaError};
pub use model::{ImageInput, VlmModel, VlmRequest, VlmResponse};
pub use pipeline::{LoadError, Pipeline, PipelineConfig, PipelineError};
pub use stream::{NullSink, StdoutSink, TokenSink};
