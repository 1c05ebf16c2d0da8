//! Catalog of tracked stablecoins and stablecoin receipt tokens.
//!
//! The registry is built once at startup and shared read-only (behind an `Arc`)
//! by the planner, the aggregation engine and the report. Any malformed entry is
//! fatal: a wrong decimals value or a duplicated address would silently corrupt
//! every total computed from it.

use std::{collections::HashMap, sync::Arc};

use alloy::primitives::{address, Address};
use holdscan_common::token::{
    parse_address, AddressExt, Protocol, NATIVE_DECIMALS, NATIVE_SENTINEL, NATIVE_SYMBOL,
};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Token {
    pub symbol: String,
    pub name: String,
    pub address: Address,
    pub decimals: u8,
    /// Set only for wrapped, vault and LP tokens.
    pub underlying: Option<String>,
    pub protocol: Protocol,
}

impl Token {
    pub fn is_native(&self) -> bool {
        self.protocol == Protocol::Native
    }

    pub fn is_receipt(&self) -> bool {
        self.underlying.is_some()
    }
}

/// Token definition as written in the config file.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct TokenEntry {
    pub symbol: String,
    #[serde(default)]
    pub name: Option<String>,
    pub address: String,
    pub decimals: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub underlying: Option<String>,
    #[serde(default = "default_protocol")]
    pub protocol: Protocol,
}

fn default_protocol() -> Protocol {
    Protocol::Issuer
}

impl TokenEntry {
    fn into_token(self) -> crate::Result<Token> {
        let invalid = |reason: &str| crate::Error::InvalidRegistryEntry {
            symbol: self.symbol.clone(),
            reason: reason.to_string(),
        };

        if self.symbol.trim().is_empty() {
            return Err(invalid("empty symbol"));
        }
        let address = parse_address(&self.address).map_err(|_| invalid("invalid address"))?;
        let decimals = self.decimals.ok_or_else(|| invalid("missing decimals"))?;
        if self.protocol == Protocol::Native {
            return Err(invalid("native asset cannot be registered as a token"));
        }

        Ok(Token {
            name: self.name.clone().unwrap_or_else(|| self.symbol.clone()),
            symbol: self.symbol,
            address,
            decimals,
            underlying: self.underlying,
            protocol: self.protocol,
        })
    }
}

#[derive(Debug)]
pub struct TokenRegistry {
    tokens: Vec<Arc<Token>>,
    native: Arc<Token>,
    by_symbol: HashMap<String, Arc<Token>>,
    by_address: HashMap<Address, Arc<Token>>,
}

impl TokenRegistry {
    /// Registry of the built-in catalog only.
    pub fn builtin() -> crate::Result<Self> {
        Self::new(builtin_tokens())
    }

    /// Built-in catalog extended with user supplied entries.
    pub fn with_extra(extra: Vec<TokenEntry>) -> crate::Result<Self> {
        let mut tokens = builtin_tokens();
        for entry in extra {
            tokens.push(entry.into_token()?);
        }
        Self::new(tokens)
    }

    pub fn new(tokens: Vec<Token>) -> crate::Result<Self> {
        if tokens.is_empty() {
            return Err(crate::Error::EmptyRegistry);
        }

        let native = Arc::new(native_token());
        let mut by_symbol = HashMap::new();
        let mut by_address = HashMap::new();
        by_symbol.insert(native.symbol.clone(), Arc::clone(&native));
        by_address.insert(native.address, Arc::clone(&native));

        let mut list = Vec::with_capacity(tokens.len());
        for token in tokens {
            if token.symbol.trim().is_empty() {
                return Err(crate::Error::InvalidRegistryEntry {
                    symbol: token.symbol,
                    reason: "empty symbol".to_string(),
                });
            }
            if token.address == Address::ZERO || token.address.is_native_sentinel() {
                return Err(crate::Error::InvalidRegistryEntry {
                    symbol: token.symbol,
                    reason: format!("reserved address {}", token.address.to_canonical()),
                });
            }
            if token.underlying.as_deref().is_some_and(|u| u.trim().is_empty()) {
                return Err(crate::Error::InvalidRegistryEntry {
                    symbol: token.symbol,
                    reason: "empty underlying symbol".to_string(),
                });
            }
            if by_symbol.contains_key(&token.symbol) {
                return Err(crate::Error::DuplicateToken(token.symbol));
            }
            if by_address.contains_key(&token.address) {
                return Err(crate::Error::DuplicateToken(token.address.to_canonical()));
            }

            let token = Arc::new(token);
            by_symbol.insert(token.symbol.clone(), Arc::clone(&token));
            by_address.insert(token.address, Arc::clone(&token));
            list.push(token);
        }

        Ok(Self {
            tokens: list,
            native,
            by_symbol,
            by_address,
        })
    }

    /// Tracked stablecoins and receipt tokens, in catalog order. Excludes the
    /// native pseudo-token.
    pub fn tokens(&self) -> &[Arc<Token>] {
        &self.tokens
    }

    /// Tracked tokens followed by the native pseudo-token.
    pub fn tokens_with_native(&self) -> Vec<Arc<Token>> {
        let mut tokens = self.tokens.clone();
        tokens.push(Arc::clone(&self.native));
        tokens
    }

    pub fn native(&self) -> &Arc<Token> {
        &self.native
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn by_symbol(&self, symbol: &str) -> Option<&Arc<Token>> {
        self.by_symbol.get(symbol)
    }

    /// Lookup by contract address. Also resolves the native sentinel.
    pub fn by_address(&self, address: &Address) -> Option<&Arc<Token>> {
        self.by_address.get(address)
    }

    pub fn protocol_of(&self, symbol: &str) -> Option<Protocol> {
        self.by_symbol(symbol).map(|token| token.protocol)
    }
}

fn native_token() -> Token {
    Token {
        symbol: NATIVE_SYMBOL.to_string(),
        name: "Ether".to_string(),
        address: NATIVE_SENTINEL,
        decimals: NATIVE_DECIMALS,
        underlying: None,
        protocol: Protocol::Native,
    }
}

type BuiltinToken = (
    &'static str,
    &'static str,
    Address,
    u8,
    Option<&'static str>,
    Protocol,
);

#[rustfmt::skip]
const BUILTIN: &[BuiltinToken] = &[
    ("USDC", "USD Coin", address!("a0b86991c6218b36c1d19d4a2e9eb0ce3606eb48"), 6, None, Protocol::Issuer),
    ("USDT", "Tether USD", address!("dac17f958d2ee523a2206206994597c13d831ec7"), 6, None, Protocol::Issuer),
    ("DAI", "Dai Stablecoin", address!("6b175474e89094c44da98b954eedeac495271d0f"), 18, None, Protocol::Issuer),
    ("BUSD", "Binance USD", address!("4fabb145d64652a948d72533023f6e7a623c7c53"), 18, None, Protocol::Issuer),
    ("FRAX", "Frax", address!("853d955acef822db058eb8505911ed77f175b99e"), 18, None, Protocol::Issuer),
    ("USDD", "Decentralized USD", address!("0c10bf8fcb7bf5412187a595ab97a3609160b5c6"), 18, None, Protocol::Issuer),
    ("TUSD", "TrueUSD", address!("0000000000085d4780b73119b644ae5ecd22b376"), 18, None, Protocol::Issuer),
    ("USDP", "Pax Dollar", address!("8e870d67f660d95d5be530380d0ec0bd388289e1"), 18, None, Protocol::Issuer),
    ("GUSD", "Gemini Dollar", address!("056fd409e1d7a124bd7017459dfea2f387b6d5cd"), 2, None, Protocol::Issuer),
    ("LUSD", "Liquity USD", address!("5f98805a4e8be255a32880fdec7f6728c6568ba0"), 18, None, Protocol::Issuer),
    ("sUSD", "Synth sUSD", address!("57ab1ec28d129707052df4df418d58a2d46d5f51"), 18, None, Protocol::Issuer),
    ("PYUSD", "PayPal USD", address!("6c3ea9036406852006290770bedfcaba0e23a0e8"), 6, None, Protocol::Issuer),
    ("aUSDC", "Aave USDC", address!("bcca60bb61934080951369a648fb03df4f96263c"), 6, Some("USDC"), Protocol::Aave),
    ("aUSDT", "Aave USDT", address!("3ed3b47dd13ec9a98b44e6204a523e766b225811"), 6, Some("USDT"), Protocol::Aave),
    ("aDAI", "Aave DAI", address!("028171bca77440897b824ca71d1c56cac55b68a3"), 18, Some("DAI"), Protocol::Aave),
    ("aBUSD", "Aave BUSD", address!("a361718326c15715591c299427c62086f69923d9"), 18, Some("BUSD"), Protocol::Aave),
    ("aFRAX", "Aave FRAX", address!("d4937682df3c8aef4fe912a96a74121c0829e664"), 18, Some("FRAX"), Protocol::Aave),
    ("aLUSD", "Aave LUSD", address!("ce1871f791548600cb59efbeffc9c38719142079"), 18, Some("LUSD"), Protocol::Aave),
    ("cUSDC", "Compound USDC", address!("39aa39c021dfbae8fac545936693ac917d5e7563"), 8, Some("USDC"), Protocol::Compound),
    ("cUSDT", "Compound USDT", address!("f650c3d88d12db855b8bf7d11be6c55a4e07dcc9"), 8, Some("USDT"), Protocol::Compound),
    ("cDAI", "Compound DAI", address!("5d3a536e4d6dbd6114cc1ead35777bab948e3643"), 8, Some("DAI"), Protocol::Compound),
    ("yvUSDC", "Yearn USDC Vault", address!("a354f35829ae975e850e23e9615b11da1b3dc4de"), 6, Some("USDC"), Protocol::Yearn),
    ("yvUSDT", "Yearn USDT Vault", address!("3b27f92c0e212c671ea351827edf93db27cc0c65"), 6, Some("USDT"), Protocol::Yearn),
    ("yvDAI", "Yearn DAI Vault", address!("da816459f1ab5631232fe5e97a05bbbb94970c95"), 18, Some("DAI"), Protocol::Yearn),
    ("3Crv", "Curve 3Pool", address!("6c3f90f043a72fa612cbac8115ee7e52bde6e490"), 18, Some("USDC/USDT/DAI"), Protocol::Curve),
    ("FRAXBP", "Curve FRAX/USDC", address!("3175df0976dfa876431c2e9ee6bc45b65d3473cc"), 18, Some("FRAX/USDC"), Protocol::Curve),
    ("LUSD3CRV", "Curve LUSD/3CRV", address!("ed279fdd11ca84beef15af5d39bb4d4bee23f0ca"), 18, Some("LUSD/3CRV"), Protocol::Curve),
    ("cvx3Crv", "Convex 3Pool", address!("30d9410ed1d5da1f6c8391af5338c93ab8d4035c"), 18, Some("3Crv"), Protocol::Convex),
    ("sd3Crv", "StakeDAO 3Pool", address!("b17640796e4c27a39af51887aff3f8dc0daf9567"), 18, Some("3Crv"), Protocol::StakeDao),
    ("sDAI", "Savings DAI", address!("83f20f44975d03b1b09e64809b757c47f942beea"), 18, Some("DAI"), Protocol::Maker),
    ("LQTY", "Liquity Token", address!("6dea81c8171d0ba574754ef6f8b412f2ed88c54d"), 18, Some("LUSD"), Protocol::Liquity),
    ("sFRAX", "Staked FRAX", address!("a663b02cf0a4b149d2ad41910cb81e23e1c41c32"), 18, Some("FRAX"), Protocol::Frax),
    ("cvxFXS", "Convex FXS", address!("feef77d3f69374f66429c91d732a244f074bdf74"), 18, Some("FXS"), Protocol::Convex),
    ("OUSD", "Origin Dollar", address!("2a8e1e676ec238d8a992307b495b45b3feaa5e86"), 18, Some("USDC/USDT/DAI"), Protocol::Origin),
    ("alUSD", "Alchemix USD", address!("bc6da0fe9ad5f3b0d58160288917aa56653660e9"), 18, Some("DAI"), Protocol::Alchemix),
    ("agEUR", "Angle EUR", address!("1a7e4e63778b4f12a199c062f3efdd288afcbce8"), 18, Some("EUR Stablecoin"), Protocol::Angle),
    ("USDe", "Ethena USD", address!("4c9edd5852cd905f086c759e8383e09bff1e68b3"), 18, Some("Synthetic USD"), Protocol::Ethena),
    ("sUSDe", "Staked Ethena USD", address!("9d39a5de30e57443bff2a8307a4256c8797a3497"), 18, Some("USDe"), Protocol::Ethena),
    ("RAI", "Reflexer RAI", address!("03ab458634910aad20ef5f1c8ee96f1d6ac54919"), 18, Some("Uncollateralized"), Protocol::Reflexer),
    ("FEI", "Fei USD", address!("956f47f50a910163d8bf957cf5846d573e7f87ca"), 18, Some("Algorithmic"), Protocol::Fei),
];

fn builtin_tokens() -> Vec<Token> {
    BUILTIN
        .iter()
        .map(
            |&(symbol, name, address, decimals, underlying, protocol)| Token {
                symbol: symbol.to_string(),
                name: name.to_string(),
                address,
                decimals,
                underlying: underlying.map(str::to_string),
                protocol,
            },
        )
        .collect()
}
