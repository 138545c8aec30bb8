mod align;
mod batch;
mod metrics;
mod report;
mod run;

pub use self::run::run;
