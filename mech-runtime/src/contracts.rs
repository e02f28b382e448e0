//! Shared Solidity contract bindings for all on-chain interactions.
//!
//! Uses alloy's `sol!` macro to generate type-safe ABI encoders/decoders for
//! the marketplace, mech, Gnosis Safe, staking, and service registry
//! contracts that make up the on-chain half of the request lifecycle.

use alloy::sol;

/// Native-payment type constant returned by `IMech::paymentType()`.
pub const NATIVE_PAYMENT_TYPE: [u8; 32] = [
    0xba, 0x69, 0x9a, 0x34, 0xbe, 0x8f, 0xe0, 0xe7, 0x72, 0x5e, 0x93, 0xdc, 0xbc, 0xe1, 0x70, 0x1b,
    0x02, 0x11, 0xa8, 0xca, 0x61, 0x33, 0x0a, 0xae, 0xb8, 0xa0, 0x5b, 0xf2, 0xec, 0x7a, 0xbe, 0xd1,
];

sol! {
    #[sol(rpc)]
    interface IMarketplace {
        function request(
            bytes calldata requestData,
            uint256 maxDeliveryRate,
            bytes32 paymentType,
            address priorityMech,
            uint256 responseTimeout,
            bytes calldata paymentData
        ) external payable returns (bytes32 requestId);

        function minResponseTimeout() external view returns (uint256);
        function maxResponseTimeout() external view returns (uint256);
        function mapRequestCounts(address mech) external view returns (uint256);

        event MarketplaceRequest(
            address indexed priorityMech,
            address indexed requester,
            uint256 numRequests,
            bytes32[] requestIds,
            bytes[] requestDatas
        );
    }

    #[sol(rpc)]
    interface IMech {
        function paymentType() external view returns (bytes32);
        function maxDeliveryRate() external view returns (uint256);
        function deliver(bytes32 requestId, bytes calldata data) external;
    }

    #[sol(rpc)]
    interface ISafe {
        function nonce() external view returns (uint256);

        function getTransactionHash(
            address to,
            uint256 value,
            bytes calldata data,
            uint8 operation,
            uint256 safeTxGas,
            uint256 baseGas,
            uint256 gasPrice,
            address gasToken,
            address refundReceiver,
            uint256 _nonce
        ) external view returns (bytes32);

        function execTransaction(
            address to,
            uint256 value,
            bytes calldata data,
            uint8 operation,
            uint256 safeTxGas,
            uint256 baseGas,
            uint256 gasPrice,
            address gasToken,
            address refundReceiver,
            bytes calldata signatures
        ) external payable returns (bool success);
    }

    #[sol(rpc)]
    interface IStaking {
        function stake(uint256 serviceId) external;
        function unstake(uint256 serviceId) external returns (uint256 reward);
        function getServiceIds() external view returns (uint256[] memory);
        function minStakingDeposit() external view returns (uint256);
        function maxNumServices() external view returns (uint256);

        function mapServiceInfo(uint256 serviceId) external view returns (
            address multisig,
            address owner,
            uint256[] memory nonces,
            uint256 tsStart,
            uint256 reward,
            uint256 inactivity
        );

        function getStakingState(uint256 serviceId) external view returns (uint8 state);
        function getNextRewardCheckpointTimestamp() external view returns (uint256);
        function checkpoint() external returns (bool);
    }

    #[sol(rpc)]
    interface IServiceRegistry {
        function getService(uint256 serviceId) external view returns (
            uint96 securityDeposit,
            address multisig,
            bytes32 configHash,
            uint32 threshold,
            uint32 maxNumAgentInstances,
            uint32 numAgentInstances,
            uint8 state
        );

        function ownerOf(uint256 serviceId) external view returns (address);
        function approve(address to, uint256 serviceId) external;
        function increaseSecurityDeposit(uint256 serviceId, uint256 amount) external;
        function mapServiceIdTokenDeposit(uint256 serviceId) external view returns (address token, uint96 deposit);
    }
}
