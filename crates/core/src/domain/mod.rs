pub mod horizon;
pub mod observation;
