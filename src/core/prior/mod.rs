pub mod latent_prior;


// 재수출
pub use latent_prior::{ModeSelector, Prior};
