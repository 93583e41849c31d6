#[cfg(not(feature = "testing"))]
pub use socket2::Socket;
#[cfg(not(feature = "testing"))]
pub use tokio::io::unix::AsyncFd;

#[cfg(feature = "testing")]
mod stubs {
    #[derive(Debug)]
    pub struct Socket();

    #[derive(Debug)]
    pub struct AsyncFd<T>(T);

    impl<T> AsyncFd<T> {
        pub fn new(inner: T) -> std::io::Result<Self> {
            Ok(AsyncFd(inner))
        }

        pub fn get_ref(&self) -> &T {
            &self.0
        }
    }
}

#[cfg(feature = "testing")]
pub use stubs::{AsyncFd, Socket};
