pub mod buffer_arena;
pub mod fixed_buffer;
