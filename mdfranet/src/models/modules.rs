mod aggregation;
mod apa;
mod attention;
mod conv_block;
mod msmb;
mod utils;

pub use aggregation::*;
pub use apa::*;
pub use attention::*;
pub use conv_block::*;
pub use msmb::*;
pub use utils::*;
