use lazy_static::lazy_static;
use regex::Regex;

mod agent;
mod id;
mod identity;

pub use agent::*;
pub use id::*;
pub use identity::*;

lazy_static! {
    static ref INTERNED_ID_REGEX: Regex =
        Regex::new(r"^[A-Za-z0-9][A-Za-z0-9\-_.]{0,63}$").unwrap();
}

pub type AgentId = InternedId;
