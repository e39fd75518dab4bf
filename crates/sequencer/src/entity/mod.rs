//! Sea-ORM entities for allocated records and their sequence counters

pub mod allocated_records;
pub mod sequence_counters;

pub use allocated_records::Entity as AllocatedRecords;
pub use sequence_counters::Entity as SequenceCounters;
