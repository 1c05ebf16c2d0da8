//! Bindings for the canonical Multicall3 deployment.
//!
//! Multicall3 lives at the same address on mainnet and most EVM chains, which
//! is what lets a single `aggregate3` call batch thousands of `balanceOf`
//! lookups into one `eth_call`.

use alloy::{primitives::Address, sol};

pub const MULTICALL3_ADDRESS: Address =
    alloy::primitives::address!("cA11bde05977b3631167028862bE2a173976CA11");

sol! {
    #[sol(rpc)]
    interface IMulticall3 {
        struct Call3 {
            address target;
            bool allowFailure;
            bytes callData;
        }

        struct Call3Result {
            bool success;
            bytes returnData;
        }

        function aggregate3(Call3[] calldata calls)
            external
            payable
            returns (Call3Result[] memory returnData);

        function getEthBalance(address addr) external view returns (uint256 balance);
    }
}
