//! Kernel console output. On bare metal everything goes to the serial port;
//! hosted builds forward to stdout/stderr so tests can print.

use core::fmt;

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    #[cfg(target_os = "none")]
    {
        use core::fmt::Write;
        // SAFETY: Single core; nothing else writes serial while we do.
        let writer = unsafe { &mut *core::ptr::addr_of_mut!(crate::serial::SERIAL_WRITER) };
        let _ = writer.write_fmt(args);
    }
    #[cfg(not(target_os = "none"))]
    std::print!("{args}");
}

#[doc(hidden)]
pub fn _eprint(args: fmt::Arguments) {
    #[cfg(target_os = "none")]
    _print(args);
    #[cfg(not(target_os = "none"))]
    std::eprint!("{args}");
}

#[doc(hidden)]
pub fn _print_nl(args: fmt::Arguments) {
    _print(args);
    _print(format_args!("\n"));
}

#[doc(hidden)]
pub fn _eprint_nl(args: fmt::Arguments) {
    _eprint(args);
    _eprint(format_args!("\n"));
}

#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => ($crate::macros::_print(core::format_args!($($arg)*)));
}

#[macro_export]
macro_rules! println {
    () => ($crate::macros::_print_nl(core::format_args!("")));
    ($($arg:tt)*) => ($crate::macros::_print_nl(core::format_args!($($arg)*)));
}

#[macro_export]
macro_rules! eprint {
    ($($arg:tt)*) => ($crate::macros::_eprint(core::format_args!($($arg)*)));
}

#[macro_export]
macro_rules! eprintln {
    () => ($crate::macros::_eprint_nl(core::format_args!("")));
    ($($arg:tt)*) => ($crate::macros::_eprint_nl(core::format_args!($($arg)*)));
}
