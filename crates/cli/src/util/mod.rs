pub mod daemon_proc;
