pub mod dim;
pub mod fixed_dim;
pub mod flops;
pub mod graph;
pub mod node;
pub mod op;
pub mod scheduler;
pub mod tensor;
pub mod value;
