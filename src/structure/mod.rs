pub mod engine;
pub mod multi_tf;

pub use engine::{MarketStructure, PatternKind, SmcEngine, SmcPattern};
pub use multi_tf::{MultiTfSignal, MultiTimeframeAnalyzer};
