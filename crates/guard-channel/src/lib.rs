mod memory;
mod render;
mod traits;

pub use memory::*;
pub use render::*;
pub use traits::*;
