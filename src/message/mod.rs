/// `message/` — host message model and the codec to Lua values
pub mod atom;
pub mod codec;

pub use atom::{selector, Atom, Message};
