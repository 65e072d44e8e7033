// Frame statistics gathered on the frame bus.

pub mod stats;
