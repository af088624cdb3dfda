use std::net::SocketAddr;
use tracing::debug;

/// Decides whether a server accepts a client's greeting. This is a hook for application-level
///  credentials; there is no cryptography involved.
pub trait Authenticator: Send {
    fn authenticate(&self, peer_addr: Option<SocketAddr>, token: Option<&[u8]>) -> bool;
}

pub struct AllowAll;

impl Authenticator for AllowAll {
    fn authenticate(&self, _peer_addr: Option<SocketAddr>, _token: Option<&[u8]>) -> bool {
        true
    }
}

/// Accepts greetings carrying a token equal to a preconfigured shared secret
pub struct SharedTokenAuthenticator {
    token: Vec<u8>,
}

impl SharedTokenAuthenticator {
    pub fn new(token: Vec<u8>) -> SharedTokenAuthenticator {
        SharedTokenAuthenticator { token }
    }
}

impl Authenticator for SharedTokenAuthenticator {
    fn authenticate(&self, peer_addr: Option<SocketAddr>, token: Option<&[u8]>) -> bool {
        let result = token == Some(self.token.as_slice());
        if !result {
            debug!("rejecting greeting from {:?}: token missing or wrong", peer_addr);
        }
        result
    }
}
