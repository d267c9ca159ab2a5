pub mod time;
pub mod vec2;
