//! The fixed PSI group: RFC 3526 Group 14 (2048-bit MODP safe prime).
//!
//! Hash-to-group squares the SHA-256 value into the prime-order subgroup of
//! quadratic residues, so blinded elements never leak a Legendre bit. Both
//! roles must use the same mapping; changing it is a breaking protocol change.

use num_bigint::{BigUint, RandBigInt};
use num_traits::{One, Zero};
use once_cell::sync::Lazy;
use rand::Rng;
use sha2::{Digest, Sha256};

// RFC 3526, section 3.
const MODP_2048_HEX: &str = "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD1\
                             29024E088A67CC74020BBEA63B139B22514A08798E3404DD\
                             EF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C245\
                             E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED\
                             EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3D\
                             C2007CB8A163BF0598DA48361C55D39A69163FA8FD24CF5F\
                             83655D23DCA3AD961C62F356208552BB9ED529077096966D\
                             670C354E4ABC9804F1746C08CA18217C32905E462E36CE3B\
                             E39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9\
                             DE2BCBF6955817183995497CEA956AE515D2261898FA0510\
                             15728E5A8AACAA68FFFFFFFFFFFFFFFF";

/// Group modulus p.
pub static P: Lazy<BigUint> = Lazy::new(|| {
    BigUint::parse_bytes(MODP_2048_HEX.as_bytes(), 16).expect("RFC 3526 constant parses")
});

/// Subgroup order q = (p-1)/2; also the exclusive upper bound for secret
/// exponents.
pub static Q: Lazy<BigUint> = Lazy::new(|| (&*P - BigUint::one()) >> 1);

/// Map an item into the quadratic-residue subgroup: SHA-256, big-endian
/// integer, squared mod p.
pub fn hash_to_group(item: &[u8]) -> BigUint {
    let digest = Sha256::digest(item);
    let h = BigUint::from_bytes_be(&digest);
    h.modpow(&BigUint::from(2u8), &P)
}

/// value^k mod p.
pub fn blind(value: &BigUint, k: &BigUint) -> BigUint {
    value.modpow(k, &P)
}

/// Range check for wire elements: [1, p-1].
pub fn is_group_element(value: &BigUint) -> bool {
    !value.is_zero() && value < &*P
}

/// Uniform secret blinding exponent in [1, (p-1)/2 - 1].
pub fn random_exponent(rng: &mut impl Rng) -> BigUint {
    rng.gen_biguint_range(&BigUint::one(), &Q)
}

/// Wire encoding for group elements (lowercase hex, no prefix).
pub fn encode_element(value: &BigUint) -> String {
    value.to_str_radix(16)
}

/// Parse a wire element. Rejects non-hex input; range checking is separate.
pub fn decode_element(s: &str) -> Option<BigUint> {
    if s.is_empty() {
        return None;
    }
    BigUint::parse_bytes(s.as_bytes(), 16)
}
