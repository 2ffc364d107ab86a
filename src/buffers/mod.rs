pub mod atomic_map;
pub mod delivery_gate;
pub mod sequence_buffer;
