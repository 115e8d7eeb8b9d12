pub mod buffer;
pub mod loss;
pub mod train;
