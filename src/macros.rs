/// Wraps a libc call, turning the conventional `-1` failure return into
/// `io::Error::last_os_error()`.
macro_rules! syscall {
  ($fn: ident ( $($arg: expr),* $(,)* ) ) => {{
    #[allow(unused_unsafe)]
    let res = unsafe { libc::$fn($($arg, )*) };
    if res == -1 {
      Err(std::io::Error::last_os_error())
    } else {
      Ok(res)
    }
  }};
}
