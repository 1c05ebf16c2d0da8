use alloy::{
    primitives::Address,
    providers::{DynProvider, Provider, ProviderBuilder},
};

pub trait StringExt {
    fn parse_as_address(&self) -> crate::Result<Address>;

    fn to_alloy_provider(&self) -> crate::Result<DynProvider>;
}

impl StringExt for str {
    fn parse_as_address(&self) -> crate::Result<Address> {
        Ok(holdscan_common::token::parse_address(self)?)
    }

    fn to_alloy_provider(&self) -> crate::Result<DynProvider> {
        self.parse()
            .map_err(|e| crate::Error::UrlParsingFailed(self.to_string(), e))
            .map(|rpc_url| ProviderBuilder::new().connect_http(rpc_url).erased())
    }
}

impl StringExt for String {
    fn parse_as_address(&self) -> crate::Result<Address> {
        self.as_str().parse_as_address()
    }

    fn to_alloy_provider(&self) -> crate::Result<DynProvider> {
        self.as_str().to_alloy_provider()
    }
}
