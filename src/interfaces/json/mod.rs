pub mod seed_reader;
pub mod stats_writer;
