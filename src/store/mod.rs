pub mod aggregates;
pub mod gateway;
pub mod spool;
pub mod tick_writer;
pub mod trade_buffer;
