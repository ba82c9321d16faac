pub mod audit;
pub mod conflict;
pub mod db;
pub mod get;
pub mod init;
pub mod list;
pub mod pending;
pub mod run;
pub mod status;
pub mod sync;
pub mod write;
