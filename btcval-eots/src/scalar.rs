// Copyright (C) 2026 The btcval Authors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! Conversions between `secp256k1` secret keys and `k256` scalars.
//!
//! `secp256k1` keeps scalar arithmetic behind secret-key tweaks and a
//! `SecretKey` can never be zero, so the signing and extraction equations are
//! evaluated on `k256::Scalar` and converted back at the edges.

use k256::elliptic_curve::ops::Reduce;
use k256::{FieldBytes, Scalar, U256};
use secp256k1::SecretKey;

/// Interpret 32 big-endian bytes as an integer modulo the group order.
pub(crate) fn reduce(bytes: [u8; 32]) -> Scalar {
    <Scalar as Reduce<U256>>::reduce_bytes(&FieldBytes::from(bytes))
}

pub(crate) fn from_secret(sk: &SecretKey) -> Scalar {
    reduce(sk.secret_bytes())
}

/// `None` for zero.
pub(crate) fn to_secret(scalar: &Scalar) -> Option<SecretKey> {
    SecretKey::from_slice(&scalar.to_bytes()).ok()
}

pub(crate) fn to_bytes(scalar: &Scalar) -> [u8; 32] {
    scalar.to_bytes().into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use secp256k1::constants::CURVE_ORDER;

    fn small(v: u8) -> Scalar {
        let mut bytes = [0u8; 32];
        bytes[31] = v;
        reduce(bytes)
    }

    #[test]
    fn test_order_reduces_to_zero() {
        assert_eq!(reduce(CURVE_ORDER), Scalar::ZERO);
        assert!(to_secret(&reduce(CURVE_ORDER)).is_none());
    }

    #[test]
    fn test_reduction_wraps_above_order() {
        let mut bytes = CURVE_ORDER;
        bytes[31] += 5;
        assert_eq!(reduce(bytes), small(5));
    }

    #[test]
    fn test_secret_round_trip() {
        let sk = SecretKey::from_slice(&[0xab; 32]).unwrap();
        assert_eq!(to_secret(&from_secret(&sk)), Some(sk));
        assert_eq!(from_secret(&sk.negate()), -from_secret(&sk));
    }

    #[test]
    fn test_extraction_equation() {
        // (s1 - s2) / (e1 - e2) recovers d from s = k + e*d
        let (k, d, e1, e2) = (small(11), small(7), small(3), small(5));
        let s1 = k + e1 * d;
        let s2 = k + e2 * d;
        let inv = Option::<Scalar>::from((e1 - e2).invert()).unwrap();
        assert_eq!((s1 - s2) * inv, d);
        assert!(bool::from((e1 - e1).invert().is_none()));
    }
}
