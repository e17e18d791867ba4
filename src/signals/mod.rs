// =============================================================================
// Signals Module
// =============================================================================
//
// `combiner` is the pure four-channel SignalCombiner.

pub mod combiner;

pub use combiner::combine;
