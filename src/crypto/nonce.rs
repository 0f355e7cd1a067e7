//! Cryptographically random decimal-digit strings, used for the staging
//! nonce and nowhere else.

use rand::Rng;

/// `random_nonce(n) -> string`: `n` random decimal digits from a CSPRNG.
pub fn random_nonce(n: usize) -> String {
    let mut rng = rand::rngs::OsRng;
    (0..n)
        .map(|_| std::char::from_digit(rng.gen_range(0..10), 10).expect("0..10 is a valid digit"))
        .collect()
}
