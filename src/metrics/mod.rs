mod recorder;

pub use recorder::*;
