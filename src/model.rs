use candle_core::Tensor;

/// Preprocessed image features plus the source image's pixel dimensions
/// (width, height), which the multimodal merge needs.
pub struct ImageInput {
    pub tensor: Tensor,
    pub size: (u32, u32),
}

/// One generation request: a fully rendered prompt, the image to merge at the
/// `<image>` placeholder (absent after the first turn), and the template's
/// stop sequence.
pub struct VlmRequest {
    pub prompt: String,
    pub image: Option<ImageInput>,
    pub stop: String,
}

/// Newly generated text only; the prompt is never echoed back.
pub struct VlmResponse {
    pub text: String,
}

/// Seam between the pipeline and the underlying vision-language model.
///
/// `run` takes `&mut self`: generation mutates sampler and cache state, and
/// the pipeline is synchronous and non-reentrant by design.
pub trait VlmModel {
    type Error: std::error::Error + Send + Sync + 'static;

    fn run(&mut self, request: VlmRequest) -> Result<VlmResponse, Self::Error>;
}
