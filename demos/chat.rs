use std::io::{BufRead, Write};
use std::path::PathBuf;

use argh::FromArgs;
use colloquy::{Message, Pipeline, PipelineConfig};

// defaults for the chat demo
const DEFAULT_MODEL: &str = "llava-hf/llava-v1.6-vicuna-7b-hf";
const DEFAULT_DEVICE: &str = "cpu";

#[derive(FromArgs)]
/// Interactive chat about a single image.
struct ChatArgs {
    /// checkpoint directory or Hugging Face Hub repo id
    #[argh(option, short = 'm', default = "DEFAULT_MODEL.to_string()")]
    model_path: String,

    /// base model id for LoRA checkpoints (accepted, loads merged weights)
    #[argh(option)]
    model_base: Option<String>,

    /// explicit tokenizer.json path for checkpoints that ship none
    #[argh(option)]
    tokenizer_path: Option<PathBuf>,

    /// the image to talk about, local path or http(s) url
    #[argh(option, short = 'i')]
    image: String,

    /// device to run on: cpu, cuda[:N] or metal
    #[argh(option, short = 'd', default = "DEFAULT_DEVICE.to_string()")]
    device: String,

    /// sampling temperature, 0 for greedy decoding
    #[argh(option, default = "0.2")]
    temperature: f64,

    /// maximum new tokens per reply
    #[argh(option, default = "512")]
    max_new_tokens: usize,

    /// sampling seed
    #[argh(option, default = "299792458")]
    seed: u64,

    /// request 8-bit weights (unsupported, kept for interface parity)
    #[argh(switch)]
    load_8bit: bool,

    /// request 4-bit weights (unsupported, kept for interface parity)
    #[argh(switch)]
    load_4bit: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args: ChatArgs = argh::from_env();

    let mut config = PipelineConfig::new(args.model_path, args.image);
    config.model_base = args.model_base;
    config.tokenizer_path = args.tokenizer_path;
    config.device = args.device;
    config.temperature = args.temperature;
    config.max_new_tokens = args.max_new_tokens;
    config.seed = args.seed;
    config.load_8bit = args.load_8bit;
    config.load_4bit = args.load_4bit;

    log::info!("loading pipeline, this can take a while on first run");
    let mut pipeline = Pipeline::load(&config)?;
    log::info!("pipeline ready; submit an empty line to exit");

    let stdin = std::io::stdin();
    loop {
        print!("USER: ");
        std::io::stdout().flush()?;
        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        let prompt = line.trim();
        if prompt.is_empty() {
            break;
        }

        // Generated tokens stream to stdout as they are sampled; the filled
        // history is also available from the returned value.
        print!("ASSISTANT: ");
        std::io::stdout().flush()?;
        pipeline.call(&[Message::user(prompt)])?;
        println!();
    }

    Ok(())
}
