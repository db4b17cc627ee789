pub mod epub;
pub mod image;
pub mod llm;
pub mod merger;
pub mod pipeline;
pub mod stability;
pub mod video;
