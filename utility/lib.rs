#![deny(dead_code)]
#![deny(unused_imports)]

pub mod bayes;
pub mod config;
pub mod design;
pub mod enumerate;
pub mod estimate;
pub mod likelihood;
pub mod loss;
pub mod marginal;
pub mod progress;
pub mod sampler;
pub mod score;
pub mod simulate;
pub mod types;
