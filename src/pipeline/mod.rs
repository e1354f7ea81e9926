pub mod reassembler;
pub mod transform;

pub use reassembler::StreamReassembler;
pub use transform::transform;
