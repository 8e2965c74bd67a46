pub mod gemini;
pub mod image_input;
pub mod path_service;
pub mod settings;
