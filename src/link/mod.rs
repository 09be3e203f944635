/**
 * Single-connection façade used by the surrounding application.
 */
pub mod link;

pub use self::link::Link;
