//! Architecture-specific context switching.
//!
//! Each backend exposes the same three items: a `Context` register frame,
//! `init_context` to prepare a frame that enters a fresh stack, and the
//! naked `switch_context` that saves the current frame and resumes another.

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        mod x86_64;
        pub use x86_64::{init_context, switch_context, Context};
    } else if #[cfg(target_arch = "aarch64")] {
        mod aarch64;
        pub use aarch64::{init_context, switch_context, Context};
    } else {
        compile_error!("nisse-runtime supports x86_64 and aarch64 only");
    }
}
