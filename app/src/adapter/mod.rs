pub mod cloud;
pub mod db;
pub mod device;
pub mod peer;
