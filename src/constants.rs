//! Special token strings used when splicing an image into a text prompt.

/// Placeholder inserted into the prompt where image features are merged in.
pub const DEFAULT_IMAGE_TOKEN: &str = "<image>";
/// Opens the image span for checkpoints trained with `mm_use_im_start_end`.
pub const DEFAULT_IM_START_TOKEN: &str = "<im_start>";
/// Closes the image span for checkpoints trained with `mm_use_im_start_end`.
pub const DEFAULT_IM_END_TOKEN: &str = "<im_end>";
