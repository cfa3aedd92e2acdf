use lasso::ThreadedRodeo;
use lazy_static::lazy_static;

pub mod constant;
pub mod db;
pub mod message;
pub mod plugin;
pub mod rpc;
pub mod state;
pub mod targets;
pub mod util;

lazy_static! {
    pub static ref INTERN: ThreadedRodeo = ThreadedRodeo::default();
}

pub mod prelude {
    pub use crate::constant::*;
    pub use crate::message::*;
    pub use crate::state::*;
}
