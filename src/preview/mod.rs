// Preview pipeline: last-value frame bus and the sinks that paint from it.

pub mod bus;
pub mod sink;
