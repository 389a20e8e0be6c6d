mod identifier;

pub use identifier::{Identifier, InvalidIdentifier, SEPARATOR};
