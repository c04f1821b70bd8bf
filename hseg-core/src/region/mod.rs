//! Region data model: per-class statistics and seam-pair bookkeeping

pub mod class;
pub mod seam;

pub use class::RegionClass;
pub use seam::RegionSeam;
