mod entities;
mod events;
mod wire;

pub use entities::*;
pub use events::*;
pub use wire::*;
