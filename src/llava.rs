//! Candle-backed LLaVA model: loading, tokenization, and the generation loop.
//!
//! Everything algorithmic lives in `candle-transformers`; this module wires
//! checkpoint files into it and drives autoregressive decoding with stopping
//! criteria and live streaming.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use candle_core::{DType, Device, IndexOp, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::generation::{LogitsProcessor, Sampling};
use candle_transformers::models::llama;
use candle_transformers::models::llava::LLaVA;
use candle_transformers::models::llava::config::{
    HFGenerationConfig, HFLLaVAConfig, HFPreProcessorConfig, LLaVAConfig,
};
use hf_hub::api::sync::{Api, ApiError, ApiRepo};
use thiserror::Error;
use tokenizers::Tokenizer;

use crate::constants::DEFAULT_IMAGE_TOKEN;
use crate::image::{ImageProcessor, PreProcessorConfig};
use crate::model::{ImageInput, VlmModel, VlmRequest, VlmResponse};
use crate::pipeline::PipelineConfig;
use crate::stream::{DetokenizeError, StdoutSink, TokenOutputStream, TokenSink};

#[derive(Debug, Error)]
pub enum LlavaError {
    #[error("hub download failed")]
    Hub(#[from] ApiError),
    #[error("failed to read model file")]
    Io(#[from] std::io::Error),
    #[error("failed to parse model configuration")]
    Json(#[from] serde_json::Error),
    #[error("tokenizer error: {0}")]
    Tokenizer(String),
    #[error(transparent)]
    Candle(#[from] candle_core::Error),
    #[error(transparent)]
    Detokenize(#[from] DetokenizeError),
    #[error("{0} not found in {1}")]
    MissingFile(String, PathBuf),
    #[error("checkpoint {0} ships no tokenizer.json; pass an explicit tokenizer path")]
    MissingTokenizer(String),
    #[error("safetensors index has no weight_map")]
    MalformedIndex,
    #[error("unsupported torch dtype {0:?}")]
    UnsupportedDtype(String),
    #[error("unknown device {0:?}, expected cpu, cuda[:N] or metal")]
    InvalidDevice(String),
    #[error("prompt references an image but no image was attached")]
    ImageTokenWithoutImage,
}

/// Maps a device spec string to a candle device.
pub fn parse_device(spec: &str) -> Result<Device, LlavaError> {
    match spec {
        "cpu" => Ok(Device::Cpu),
        "cuda" => Ok(Device::new_cuda(0)?),
        "metal" => Ok(Device::new_metal(0)?),
        s => match s.strip_prefix("cuda:").and_then(|ord| ord.parse::<usize>().ok()) {
            Some(ordinal) => Ok(Device::new_cuda(ordinal)?),
            None => Err(LlavaError::InvalidDevice(s.to_string())),
        },
    }
}

/// Where checkpoint files come from: a local directory or a hub repo.
enum ModelFiles {
    Local(PathBuf),
    Hub(ApiRepo),
}

impl ModelFiles {
    fn resolve(model_path: &str) -> Result<Self, LlavaError> {
        let dir = Path::new(model_path);
        if dir.is_dir() {
            Ok(ModelFiles::Local(dir.to_path_buf()))
        } else {
            Ok(ModelFiles::Hub(Api::new()?.model(model_path.to_string())))
        }
    }

    fn get(&self, name: &str) -> Result<PathBuf, LlavaError> {
        match self {
            ModelFiles::Local(dir) => {
                let path = dir.join(name);
                if path.is_file() {
                    Ok(path)
                } else {
                    Err(LlavaError::MissingFile(name.to_string(), dir.clone()))
                }
            }
            ModelFiles::Hub(repo) => Ok(repo.get(name)?),
        }
    }
}

/// Collects the safetensors shards named by the index file, or falls back to
/// the single-file layout.
fn safetensor_paths(files: &ModelFiles) -> Result<Vec<PathBuf>, LlavaError> {
    match files.get("model.safetensors.index.json") {
        Ok(index_path) => {
            let index: serde_json::Value = serde_json::from_slice(&fs::read(index_path)?)?;
            let weight_map = index
                .get("weight_map")
                .and_then(|v| v.as_object())
                .ok_or(LlavaError::MalformedIndex)?;
            let shards: BTreeSet<&str> = weight_map.values().filter_map(|v| v.as_str()).collect();
            shards.into_iter().map(|name| files.get(name)).collect()
        }
        Err(_) => Ok(vec![files.get("model.safetensors")?]),
    }
}

/// Splits the prompt on the image placeholder, encodes the text chunks, and
/// splices the image token index between them. BOS, when the tokenizer emits
/// one, is kept once at the front.
pub fn tokenize_with_image(
    prompt: &str,
    tokenizer: &Tokenizer,
    image_token_index: i64,
    bos_token_id: i64,
) -> Result<Vec<i64>, LlavaError> {
    let chunks = prompt
        .split(DEFAULT_IMAGE_TOKEN)
        .map(|chunk| {
            tokenizer
                .encode(chunk, true)
                .map(|enc| enc.get_ids().iter().map(|&id| id as i64).collect())
                .map_err(|e| LlavaError::Tokenizer(e.to_string()))
        })
        .collect::<Result<Vec<Vec<i64>>, _>>()?;
    Ok(splice_image_tokens(&chunks, image_token_index, bos_token_id))
}

fn splice_image_tokens(chunks: &[Vec<i64>], image_token_index: i64, bos_token_id: i64) -> Vec<i64> {
    // Each encoded chunk repeats the leading BOS; skip it everywhere and emit
    // it once up front.
    let offset = usize::from(chunks.first().and_then(|c| c.first()) == Some(&bos_token_id));
    let mut ids = Vec::new();
    if offset == 1 {
        ids.push(bos_token_id);
    }
    for (i, chunk) in chunks.iter().enumerate() {
        if i > 0 {
            ids.push(image_token_index);
        }
        ids.extend_from_slice(&chunk[offset.min(chunk.len())..]);
    }
    ids
}

/// LLaVA checkpoint loaded through candle, implementing the model seam.
pub struct CandleLlava {
    model: LLaVA,
    stream: TokenOutputStream,
    sink: Box<dyn TokenSink + Send>,
    logits_processor: LogitsProcessor,
    processor: ImageProcessor,
    llama_config: llama::Config,
    device: Device,
    dtype: DType,
    eos_token_id: u32,
    bos_token_id: i64,
    image_token_index: i64,
    use_im_start_end: bool,
    max_new_tokens: usize,
}

impl CandleLlava {
    /// One-time checkpoint load. Streams live tokens to stdout by default;
    /// swap the sink with [`CandleLlava::with_sink`].
    pub fn new(config: &PipelineConfig) -> Result<Self, LlavaError> {
        if config.model_base.is_some() {
            log::warn!("model_base is ignored: this backend loads merged weights only");
        }
        if config.load_8bit || config.load_4bit {
            log::warn!("quantized loading is not supported; using full-precision weights");
        }

        let device = parse_device(&config.device)?;
        let files = ModelFiles::resolve(&config.model_path)?;

        log::info!("loading model configuration from {}", config.model_path);
        let raw: serde_json::Value = serde_json::from_slice(&fs::read(files.get("config.json")?)?)?;
        // HF-exported checkpoints nest the language model settings under
        // text_config; native LLaVA checkpoints keep everything top-level.
        let hf_layout = raw.get("text_config").is_some();
        let (llava_config, clip_vision_config, preprocessor_config) = if hf_layout {
            let hf_config: HFLLaVAConfig = serde_json::from_value(raw)?;
            let generation_config: HFGenerationConfig =
                serde_json::from_slice(&fs::read(files.get("generation_config.json")?)?)?;
            let preprocessor_path = files.get("preprocessor_config.json")?;
            let hf_preprocessor: HFPreProcessorConfig =
                serde_json::from_slice(&fs::read(&preprocessor_path)?)?;
            let preprocessor: PreProcessorConfig =
                serde_json::from_slice(&fs::read(&preprocessor_path)?)?;
            (
                hf_config.to_llava_config(&generation_config, &hf_preprocessor),
                Some(hf_config.to_clip_vision_config()),
                preprocessor,
            )
        } else {
            let llava_config: LLaVAConfig = serde_json::from_value(raw)?;
            let preprocessor = vision_tower_preprocessor(llava_config.mm_vision_tower.as_deref());
            (llava_config, None, preprocessor)
        };

        let dtype = match llava_config.torch_dtype.as_str() {
            "float16" => DType::F16,
            "bfloat16" => DType::BF16,
            "float32" => DType::F32,
            other => return Err(LlavaError::UnsupportedDtype(other.to_string())),
        };
        // Half precision is pathological on CPU.
        let dtype = if device.is_cpu() && matches!(dtype, DType::F16 | DType::BF16) {
            log::info!("cpu device: loading {dtype:?} checkpoint as F32");
            DType::F32
        } else {
            dtype
        };

        let tokenizer_file = match &config.tokenizer_path {
            Some(path) => path.clone(),
            None => files
                .get("tokenizer.json")
                .map_err(|_| LlavaError::MissingTokenizer(config.model_path.clone()))?,
        };
        let tokenizer = Tokenizer::from_file(&tokenizer_file)
            .map_err(|e| LlavaError::Tokenizer(e.to_string()))?;

        log::info!("loading model weights");
        let weight_paths = safetensor_paths(&files)?;
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&weight_paths, dtype, &device)? };
        let model = LLaVA::load(vb, &llava_config, clip_vision_config)?;
        log::debug!("model weights loaded from {} shard(s)", weight_paths.len());

        let sampling = if config.temperature <= 0.0 {
            Sampling::ArgMax
        } else {
            Sampling::All {
                temperature: config.temperature,
            }
        };
        let logits_processor = LogitsProcessor::from_sampling(config.seed, sampling);

        Ok(Self {
            model,
            stream: TokenOutputStream::new(tokenizer),
            sink: Box::new(StdoutSink),
            logits_processor,
            processor: ImageProcessor::new(&preprocessor_config),
            llama_config: llava_config.to_llama_config(),
            device,
            dtype,
            eos_token_id: llava_config.eos_token_id as u32,
            bos_token_id: llava_config.bos_token_id as i64,
            image_token_index: llava_config.image_token_index as i64,
            use_im_start_end: llava_config.mm_use_im_start_end,
            max_new_tokens: config.max_new_tokens,
        })
    }

    /// Replaces the live-token sink.
    pub fn with_sink(mut self, sink: Box<dyn TokenSink + Send>) -> Self {
        self.sink = sink;
        self
    }

    pub fn processor(&self) -> &ImageProcessor {
        &self.processor
    }

    pub fn uses_im_start_end(&self) -> bool {
        self.use_im_start_end
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Embeds the prompt, merging image features when an image is attached.
    fn embed_prompt(
        &self,
        input_ids: &[i64],
        image: Option<&ImageInput>,
    ) -> Result<Tensor, LlavaError> {
        match image {
            Some(image) => {
                let ids = Tensor::from_vec(
                    input_ids.to_vec(),
                    (1, input_ids.len()),
                    &self.device,
                )?;
                Ok(self.model.prepare_inputs_labels_for_multimodal(
                    &ids,
                    &[image.tensor.clone()],
                    &[image.size],
                )?)
            }
            None => {
                if input_ids.contains(&self.image_token_index) {
                    return Err(LlavaError::ImageTokenWithoutImage);
                }
                let ids: Vec<u32> = input_ids.iter().map(|&id| id as u32).collect();
                let ids = Tensor::from_vec(ids, input_ids.len(), &self.device)?;
                Ok(self.model.llama.embed(&ids)?.unsqueeze(0)?)
            }
        }
    }
}

impl VlmModel for CandleLlava {
    type Error = LlavaError;

    fn run(&mut self, request: VlmRequest) -> Result<VlmResponse, Self::Error> {
        let input_ids = tokenize_with_image(
            &request.prompt,
            self.stream.tokenizer(),
            self.image_token_index,
            self.bos_token_id,
        )?;
        log::debug!(
            "prompt tokenized to {} ids, image attached: {}",
            input_ids.len(),
            request.image.is_some()
        );
        let mut input_embeds = self.embed_prompt(&input_ids, request.image.as_ref())?;

        // KV state must not leak across turns; the full prompt is re-fed each
        // run, so the cache starts fresh.
        let mut cache = llama::Cache::new(true, self.dtype, &self.llama_config, &self.device)?;
        self.stream.clear();

        let mut generated = String::new();
        let mut index_pos = 0;
        for index in 0..self.max_new_tokens {
            let (_, embed_len, _) = input_embeds.dims3()?;
            let (context_size, context_index) = if index > 0 {
                (1, index_pos)
            } else {
                (embed_len, 0)
            };
            let input = input_embeds.i((.., embed_len.saturating_sub(context_size).., ..))?;
            let logits = self.model.forward(&input, context_index, &mut cache)?;
            let logits = logits.squeeze(0)?;
            let (_, step_len, _) = input.dims3()?;
            index_pos += step_len;

            let next_token = self.logits_processor.sample(&logits)?;
            if next_token == self.eos_token_id {
                break;
            }
            let next = Tensor::from_vec(vec![next_token], 1, &self.device)?;
            let next_embeds = self.model.llama.embed(&next)?.unsqueeze(0)?;
            input_embeds = Tensor::cat(&[input_embeds, next_embeds], 1)?;

            if let Some(piece) = self.stream.next_token(next_token)? {
                self.sink.on_token(&piece);
                generated.push_str(&piece);
            }
            // Keyword stopping criteria: templates whose stop sequence is a
            // plain string (not the EOS token) end mid-stream.
            if !request.stop.is_empty() {
                let tail = self.stream.decode_rest()?.unwrap_or_default();
                let live = [generated.as_str(), tail.as_str()].concat();
                if live.ends_with(&request.stop) {
                    generated = live[..live.len() - request.stop.len()].to_string();
                    return Ok(VlmResponse { text: generated });
                }
            }
        }

        if let Some(rest) = self.stream.decode_rest()? {
            self.sink.on_token(&rest);
            generated.push_str(&rest);
        }
        if !request.stop.is_empty() && generated.ends_with(&request.stop) {
            generated.truncate(generated.len() - request.stop.len());
        }
        Ok(VlmResponse { text: generated })
    }
}

/// Native checkpoints keep the preprocessor settings next to the vision
/// tower; fall back to the CLIP-336 defaults when the tower is unreachable.
fn vision_tower_preprocessor(tower: Option<&str>) -> PreProcessorConfig {
    let Some(tower) = tower else {
        return PreProcessorConfig::default();
    };
    let fetched: Result<PreProcessorConfig, LlavaError> = Api::new()
        .and_then(|api| api.model(tower.to_string()).get("preprocessor_config.json"))
        .map_err(LlavaError::from)
        .and_then(|path| Ok(serde_json::from_slice(&fs::read(path)?)?));
    match fetched {
        Ok(config) => config,
        Err(e) => {
            log::warn!("could not fetch preprocessor config from {tower}: {e}; using defaults");
            PreProcessorConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const IMG: i64 = -200;
    const BOS: i64 = 1;

    #[test]
    fn splice_keeps_bos_once_and_inserts_image_token() {
        let chunks = vec![vec![BOS, 10, 11], vec![BOS, 12]];
        let ids = splice_image_tokens(&chunks, IMG, BOS);
        assert_eq!(ids, vec![BOS, 10, 11, IMG, 12]);
    }

    #[test]
    fn splice_without_bos() {
        let chunks = vec![vec![10, 11], vec![12]];
        let ids = splice_image_tokens(&chunks, IMG, BOS);
        assert_eq!(ids, vec![10, 11, IMG, 12]);
    }

    #[test]
    fn splice_single_chunk_has_no_image_token() {
        let chunks = vec![vec![BOS, 10, 11]];
        let ids = splice_image_tokens(&chunks, IMG, BOS);
        assert_eq!(ids, vec![BOS, 10, 11]);
    }

    #[test]
    fn splice_handles_trailing_placeholder() {
        // Prompt ending in <image> produces an empty last chunk.
        let chunks = vec![vec![BOS, 10], vec![]];
        let ids = splice_image_tokens(&chunks, IMG, BOS);
        assert_eq!(ids, vec![BOS, 10, IMG]);
    }

    #[test]
    fn cpu_device_parses() {
        assert!(matches!(parse_device("cpu"), Ok(Device::Cpu)));
        assert!(matches!(
            parse_device("tpu"),
            Err(LlavaError::InvalidDevice(_))
        ));
    }
}
