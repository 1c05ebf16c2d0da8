use std::{collections::HashMap, time::Duration};

use alloy::primitives::Address;
use holdscan_common::token::parse_address;

use crate::{
    alchemy::AlchemyClient,
    retry::RetryPolicy,
    store::{CollectionSaveStats, HolderStore, OwnerHolding},
};

#[derive(Debug, Default)]
pub struct FetchedHolders {
    pub owners: Vec<OwnerHolding>,
    pub pages: usize,
    /// False when a later page failed and the listing was cut short.
    pub complete: bool,
}

/// Walks the paginated owner listing of an NFT contract.
pub struct CollectionFetcher {
    client: AlchemyClient,
    retry: RetryPolicy,
    page_delay: Duration,
}

impl CollectionFetcher {
    pub fn new(client: AlchemyClient, retry: RetryPolicy) -> Self {
        Self {
            client,
            retry,
            page_delay: Duration::from_millis(300),
        }
    }

    pub fn with_page_delay(mut self, page_delay: Duration) -> Self {
        self.page_delay = page_delay;
        self
    }

    /// Every distinct non-zero owner of `contract`. A failure on the first
    /// page is an error; a failure later keeps what was collected so far.
    pub async fn fetch_holders(&self, contract: &Address) -> crate::Result<FetchedHolders> {
        let mut fetched = FetchedHolders::default();
        let mut positions: HashMap<Address, usize> = HashMap::new();
        let mut page_key: Option<String> = None;

        loop {
            let label = format!("owners of {contract} page {}", fetched.pages + 1);
            let page = match self
                .retry
                .run(&label, || {
                    self.client
                        .owners_for_contract(contract, page_key.as_deref())
                })
                .await
            {
                Ok(page) => page,
                Err(err) if fetched.pages == 0 => return Err(err),
                Err(err) => {
                    log::error!("{label} failed, keeping {} owners: {err}", fetched.owners.len());
                    return Ok(fetched);
                }
            };
            fetched.pages += 1;

            for owner in page.owners {
                let address = match parse_address(&owner.owner_address) {
                    Ok(address) if address != Address::ZERO => address,
                    Ok(_) => continue,
                    Err(err) => {
                        log::warn!("skipping owner: {err}");
                        continue;
                    }
                };
                let token_ids = owner.token_balances.into_iter().map(|t| t.token_id);
                match positions.get(&address) {
                    Some(&i) => fetched.owners[i].token_ids.extend(token_ids),
                    None => {
                        positions.insert(address, fetched.owners.len());
                        fetched.owners.push(OwnerHolding {
                            address,
                            token_ids: token_ids.collect(),
                        });
                    }
                }
            }
            log::info!(
                "{label}: {} owners so far",
                fetched.owners.len()
            );

            match page.page_key.filter(|key| !key.is_empty()) {
                Some(next) => page_key = Some(next),
                None => {
                    fetched.complete = true;
                    return Ok(fetched);
                }
            }
            tokio::time::sleep(self.page_delay).await;
        }
    }

    /// Fetches the owners of one collection and records them.
    pub async fn fetch_into(
        &self,
        store: &mut HolderStore,
        name: &str,
        contract: &Address,
    ) -> crate::Result<(FetchedHolders, CollectionSaveStats)> {
        let fetched = self.fetch_holders(contract).await?;
        let stats = store.save_collection_holders(name, contract, &fetched.owners)?;
        log::info!(
            "{name}: {} holders ({} new) over {} pages",
            stats.total_holders,
            stats.new_holders,
            fetched.pages
        );
        Ok((fetched, stats))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use wiremock::{
        matchers::{method, path, query_param},
        Mock, MockServer, ResponseTemplate,
    };

    use super::*;

    const CONTRACT: &str = "0x5af0d9827e0c53e4799bb226655a1de152a425a5";

    async fn fetcher(server: &MockServer) -> CollectionFetcher {
        let client = AlchemyClient::new("key".to_string(), Duration::from_secs(5))
            .unwrap()
            .with_base_urls(&server.uri(), &server.uri());
        CollectionFetcher::new(client, RetryPolicy::immediate(2)).with_page_delay(Duration::ZERO)
    }

    #[tokio::test]
    async fn test_pages_are_merged() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/key/getOwnersForContract"))
            .and(query_param("pageKey", "p2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "owners": [
                    {
                        "ownerAddress": "0x1111111111111111111111111111111111111111",
                        "tokenBalances": [{ "tokenId": "3", "balance": "1" }]
                    },
                    {
                        "ownerAddress": "0x2222222222222222222222222222222222222222",
                        "tokenBalances": []
                    }
                ],
                "pageKey": null
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/key/getOwnersForContract"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "owners": [
                    {
                        "ownerAddress": "0x0000000000000000000000000000000000000000",
                        "tokenBalances": [{ "tokenId": "9", "balance": "1" }]
                    },
                    {
                        "ownerAddress": "0x1111111111111111111111111111111111111111",
                        "tokenBalances": [
                            { "tokenId": "1", "balance": "1" },
                            { "tokenId": "2", "balance": "1" }
                        ]
                    }
                ],
                "pageKey": "p2"
            })))
            .mount(&server)
            .await;

        let fetched = fetcher(&server)
            .await
            .fetch_holders(&CONTRACT.parse().unwrap())
            .await
            .unwrap();
        assert!(fetched.complete);
        assert_eq!(fetched.pages, 2);
        assert_eq!(fetched.owners.len(), 2);
        assert_eq!(fetched.owners[0].token_ids, vec!["1", "2", "3"]);

        let mut store = HolderStore::open_in_memory().unwrap();
        let stats = store
            .save_collection_holders("Milady", &CONTRACT.parse().unwrap(), &fetched.owners)
            .unwrap();
        assert_eq!(stats.new_holders, 2);
        assert_eq!(
            store
                .wallet(&Address::repeat_byte(0x11))
                .unwrap()
                .unwrap()
                .total_nfts,
            3
        );
    }

    #[tokio::test]
    async fn test_first_page_failure_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let result = fetcher(&server)
            .await
            .fetch_holders(&CONTRACT.parse().unwrap())
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_later_page_failure_keeps_partial_result() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(query_param("pageKey", "p2"))
            .respond_with(ResponseTemplate::new(400))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "owners": [{ "ownerAddress": "0x1111111111111111111111111111111111111111" }],
                "pageKey": "p2"
            })))
            .mount(&server)
            .await;

        let fetched = fetcher(&server)
            .await
            .fetch_holders(&CONTRACT.parse().unwrap())
            .await
            .unwrap();
        assert!(!fetched.complete);
        assert_eq!(fetched.owners.len(), 1);
        assert!(fetched.owners[0].token_ids.is_empty());
    }
}
