mod academic_year;
mod enrollment;
mod fee;
mod ledger;
mod money;
mod people;
mod role;
mod security;
mod summary;

pub use academic_year::*;
pub use enrollment::*;
pub use fee::*;
pub use ledger::*;
pub use money::*;
pub use people::*;
pub use role::*;
pub use security::*;
pub use summary::*;
