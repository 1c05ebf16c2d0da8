use std::time::Duration;

use alloy::primitives::Address;
use holdscan_common::token::NATIVE_SENTINEL;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::{
    engine::{BalanceSource, RawBalance, RawValue},
    planner::{PlanUnit, MAX_ADDRESSES_PER_REQUEST},
    reqwest::build_client,
    Reqwest,
};

pub const DATA_API_BASE: &str = "https://api.g.alchemy.com/data/v1";
pub const NFT_API_BASE: &str = "https://eth-mainnet.g.alchemy.com/nft/v3";
pub const NETWORK: &str = "eth-mainnet";

/// Guard against an upstream that keeps handing out page keys.
const MAX_BALANCE_PAGES: usize = 50;

#[derive(Serialize, Deserialize, Debug)]
pub struct AlchemyData<T> {
    pub data: T,
}

#[derive(Serialize, Debug)]
struct AddressNetworks<'a> {
    address: String,
    networks: [&'a str; 1],
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
struct BalancesRequest<'a> {
    addresses: Vec<AddressNetworks<'a>>,
    include_native_tokens: bool,
    include_erc20_tokens: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    page_key: Option<String>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct TokenBalances {
    #[serde(default)]
    pub tokens: Vec<TokenBalanceEntry>,
    pub page_key: Option<String>,
}

// docs: https://docs.alchemy.com/reference/get-token-balances-by-address
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TokenBalanceEntry {
    /// The wallet.
    pub address: Address,
    pub network: String,
    /// `None` for the native asset.
    pub token_address: Option<Address>,
    pub token_balance: Option<String>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct OwnersPage {
    pub owners: Vec<ContractOwner>,
    pub page_key: Option<String>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ContractOwner {
    pub owner_address: String,
    #[serde(default)]
    pub token_balances: Vec<OwnedToken>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct OwnedToken {
    pub token_id: String,
}

#[derive(Clone, Debug)]
pub struct AlchemyClient {
    client: Client,
    api_key: String,
    data_base: String,
    nft_base: String,
}

impl AlchemyClient {
    pub fn new(api_key: String, timeout: Duration) -> crate::Result<Self> {
        Ok(Self {
            client: build_client(timeout)?,
            api_key,
            data_base: DATA_API_BASE.to_string(),
            nft_base: NFT_API_BASE.to_string(),
        })
    }

    /// Points the client somewhere else, e.g. a local mock server.
    pub fn with_base_urls(mut self, data_base: &str, nft_base: &str) -> Self {
        self.data_base = data_base.trim_end_matches('/').to_string();
        self.nft_base = nft_base.trim_end_matches('/').to_string();
        self
    }

    /// Native and ERC20 balances of up to three wallets. Follows page keys
    /// until the listing is complete; any failed page fails the whole call.
    pub async fn token_balances_by_address(
        &self,
        wallets: &[Address],
    ) -> crate::Result<Vec<TokenBalanceEntry>> {
        if wallets.len() > MAX_ADDRESSES_PER_REQUEST {
            return Err(crate::Error::TooManyAddresses(wallets.len()));
        }

        let url = format!(
            "{}/{}/assets/tokens/balances/by-address",
            self.data_base, self.api_key
        );

        let mut entries = Vec::new();
        let mut page_key = None;
        for _ in 0..MAX_BALANCE_PAGES {
            let body = BalancesRequest {
                addresses: wallets
                    .iter()
                    .map(|wallet| AddressNetworks {
                        address: wallet.to_string(),
                        networks: [NETWORK],
                    })
                    .collect(),
                include_native_tokens: true,
                include_erc20_tokens: true,
                page_key: page_key.take(),
            };

            let response = Reqwest::post(&self.client, &url)?
                .json_body(&body)
                .receive_json::<AlchemyData<TokenBalances>>()
                .await?;

            entries.extend(response.data.tokens);
            match response.data.page_key.filter(|key| !key.is_empty()) {
                Some(next) => page_key = Some(next),
                None => return Ok(entries),
            }
        }

        Err(crate::Error::AlchemyResponse("balance listing never ended"))
    }

    /// One page of owners of an NFT contract.
    pub async fn owners_for_contract(
        &self,
        contract: &Address,
        page_key: Option<&str>,
    ) -> crate::Result<OwnersPage> {
        let url = format!("{}/{}/getOwnersForContract", self.nft_base, self.api_key);

        let mut query = vec![
            ("contractAddress", contract.to_string()),
            ("withTokenBalances", "true".to_string()),
        ];
        if let Some(page_key) = page_key {
            query.push(("pageKey", page_key.to_string()));
        }

        Reqwest::get(&self.client, url)?
            .query(&query)
            .receive_json::<OwnersPage>()
            .await
    }
}

/// Balance source backed by the balances-by-address API.
pub struct AlchemyBalanceSource {
    client: AlchemyClient,
}

impl AlchemyBalanceSource {
    pub fn new(client: AlchemyClient) -> Self {
        Self { client }
    }
}

impl BalanceSource for AlchemyBalanceSource {
    fn name(&self) -> &'static str {
        "alchemy"
    }

    async fn fetch(&self, unit: &PlanUnit) -> crate::Result<Vec<RawBalance>> {
        let entries = self.client.token_balances_by_address(&unit.wallets).await?;

        Ok(entries
            .into_iter()
            .filter(|entry| entry.network == NETWORK)
            .map(|entry| RawBalance {
                wallet: entry.address,
                token: entry.token_address.unwrap_or(NATIVE_SENTINEL),
                value: entry
                    .token_balance
                    .map(RawValue::Hex)
                    .unwrap_or(RawValue::Failed),
            })
            .collect())
    }
}
