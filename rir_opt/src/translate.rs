//! Bidirectional lowering between RIR and PIR.

pub mod pir2rir;
pub mod rir2pir;
