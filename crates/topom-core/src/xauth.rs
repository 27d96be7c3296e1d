//! XAuth tokens for admin RPCs.
//!
//! Every mutating admin call carries an `xauth` path segment derived from
//! the product name and the shared `product_auth` secret. The controller's
//! own token covers its API; a proxy's token additionally binds the
//! proxy's random identity token.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// The product's shared secret.
///
/// The `Debug` impl redacts the key.
#[derive(Clone)]
pub struct ProductSecret {
    product: String,
    key: Vec<u8>,
}

impl ProductSecret {
    pub fn new(product_name: &str, product_auth: &str) -> Self {
        ProductSecret {
            product: product_name.to_owned(),
            key: product_auth.as_bytes().to_vec(),
        }
    }

    fn sign(&self, parts: &[&[u8]]) -> String {
        let mut mac =
            HmacSha256::new_from_slice(&self.key).expect("HMAC accepts any key length");
        for part in parts {
            mac.update(part);
        }
        hex::encode(mac.finalize().into_bytes())
    }

    /// Token guarding the controller's own admin API.
    pub fn topom_xauth(&self) -> String {
        self.sign(&[self.product.as_bytes()])
    }

    /// Token guarding the admin API of the proxy identified by `token`.
    pub fn proxy_xauth(&self, token: &str) -> String {
        self.sign(&[self.product.as_bytes(), b"\0", token.as_bytes()])
    }
}

impl std::fmt::Debug for ProductSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProductSecret")
            .field("product", &self.product)
            .field("key", &"[redacted]")
            .finish()
    }
}

/// Compares a presented token with the expected one in constant time.
pub fn verify(expected: &str, given: &str) -> bool {
    let (a, b) = (expected.as_bytes(), given.as_bytes());
    a.len() == b.len() && bool::from(a.ct_eq(b))
}
