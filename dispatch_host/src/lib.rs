//! Host side of the dispatcher: machine drivers, jobs, and the workers that
//! keep host state in step with the devices.

pub mod communication;
pub mod config;
pub mod dispatcher;
pub mod firmware;
pub mod jobs;
pub mod machine;
pub mod print_buffer;
pub mod print_loop;
pub mod recipe;
