pub mod gates;
pub mod gated_linear;
pub mod stack;


// 재수출
pub use gates::GateMasks;
pub use gated_linear::{Act, GatedLinear};
pub use stack::DecoderStack;
