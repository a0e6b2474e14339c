pub mod claim_reader;
