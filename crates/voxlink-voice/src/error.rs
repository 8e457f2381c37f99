use thiserror::Error;
use voxlink_asr::AsrError;

#[derive(Error, Debug)]
pub enum VoiceError {
    #[error("device transport error: {0}")]
    Transport(String),

    #[error("recognition error: {0}")]
    Recognition(#[from] AsrError),

    #[error("reply generation failed: {0}")]
    Generation(String),

    #[error("speech synthesis failed: {0}")]
    Synthesis(String),
}
