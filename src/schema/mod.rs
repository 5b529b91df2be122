pub mod fragment;
pub mod graph;
pub mod ids;
pub mod value;
