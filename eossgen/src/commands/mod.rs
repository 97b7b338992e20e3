pub mod inspect;
pub mod simulate;
pub mod volume;
