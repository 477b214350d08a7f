#[macro_export]
macro_rules! debug_log {
	($($arg:tt)*) => {{
		#[cfg(debug_assertions)]
		{
			eprintln!($($arg)*);
		}
	}};
}

pub mod args;
pub mod config;
pub mod state;
pub mod supervisor;
pub mod aidev;
pub mod server;
