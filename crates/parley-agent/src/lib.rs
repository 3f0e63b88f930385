pub mod elevenlabs;
pub mod openai;
mod retry;

pub use elevenlabs::ElevenLabsSynthesizer;
pub use openai::OpenAiProvider;
