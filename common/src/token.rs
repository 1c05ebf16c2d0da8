use std::fmt::{Display, Formatter};

use alloy::{
    hex,
    primitives::{address, Address},
};
use serde::{Deserialize, Serialize};

/// Sentinel contract address indexers use for the chain's native asset.
pub const NATIVE_SENTINEL: Address = address!("eeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeee");
pub const NATIVE_SYMBOL: &str = "ETH";
pub const NATIVE_DECIMALS: u8 = 18;

/// Issuer or wrapper protocol of a tracked token.
///
/// Stored explicitly on every registry entry so that grouping by protocol never
/// depends on the shape of the symbol.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    /// Plain fiat-backed or crypto-backed stablecoin, no wrapper.
    Issuer,
    Aave,
    Compound,
    Yearn,
    Curve,
    Convex,
    StakeDao,
    Maker,
    Liquity,
    Frax,
    Origin,
    Alchemix,
    Angle,
    Ethena,
    Reflexer,
    Fei,
    Native,
}

impl Protocol {
    /// True for lending, vault, LP and staking wrappers.
    pub fn is_defi(&self) -> bool {
        !matches!(self, Protocol::Issuer | Protocol::Native)
    }
}

impl Display for Protocol {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Protocol::Issuer => "Issuer",
            Protocol::Aave => "Aave",
            Protocol::Compound => "Compound",
            Protocol::Yearn => "Yearn",
            Protocol::Curve => "Curve",
            Protocol::Convex => "Convex",
            Protocol::StakeDao => "StakeDAO",
            Protocol::Maker => "MakerDAO",
            Protocol::Liquity => "Liquity",
            Protocol::Frax => "Frax",
            Protocol::Origin => "Origin",
            Protocol::Alchemix => "Alchemix",
            Protocol::Angle => "Angle",
            Protocol::Ethena => "Ethena",
            Protocol::Reflexer => "Reflexer",
            Protocol::Fei => "Fei",
            Protocol::Native => "Native",
        };
        write!(f, "{name}")
    }
}

pub trait AddressExt {
    /// Lowercase `0x`-prefixed form used as the wallet key in storage.
    fn to_canonical(&self) -> String;

    fn is_native_sentinel(&self) -> bool;
}

impl AddressExt for Address {
    fn to_canonical(&self) -> String {
        hex::encode_prefixed(self)
    }

    fn is_native_sentinel(&self) -> bool {
        *self == NATIVE_SENTINEL
    }
}

pub fn parse_address(s: &str) -> crate::Result<Address> {
    s.trim()
        .parse::<Address>()
        .map_err(|_| crate::Error::InvalidAddress(s.to_string()))
}
