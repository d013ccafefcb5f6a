// Smoldot
// Copyright (C) 2023  Pierre Krieger
// SPDX-License-Identifier: GPL-3.0-or-later WITH Classpath-exception-2.0

// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.

// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! Names and wire types of the JSON-RPC methods and notifications used by the client.
//!
//! Two families of methods are covered: the `chainHead_v1_*` and `transaction_v1_*` functions of
//! the new JSON-RPC API, and the so-called *legacy* functions (`chain_*`, `state_*`, `author_*`)
//! that older servers expose.
//!
//! All the types implement both [`serde::Serialize`] and [`serde::Deserialize`], so that they can
//! be used both to parse what a server sends and to implement a server.

use crate::{header, util};

use alloc::{
    borrow::Cow,
    collections::BTreeMap,
    format,
    string::{String, ToString as _},
    vec::Vec,
};
use core::fmt;

pub const CHAIN_HEAD_FOLLOW: &str = "chainHead_v1_follow";
pub const CHAIN_HEAD_UNFOLLOW: &str = "chainHead_v1_unfollow";
pub const CHAIN_HEAD_FOLLOW_EVENT: &str = "chainHead_v1_followEvent";
pub const CHAIN_HEAD_BODY: &str = "chainHead_v1_body";
pub const CHAIN_HEAD_HEADER: &str = "chainHead_v1_header";
pub const CHAIN_HEAD_STORAGE: &str = "chainHead_v1_storage";
pub const CHAIN_HEAD_CALL: &str = "chainHead_v1_call";
pub const CHAIN_HEAD_UNPIN: &str = "chainHead_v1_unpin";
pub const CHAIN_HEAD_CONTINUE: &str = "chainHead_v1_continue";
pub const CHAIN_HEAD_STOP_OPERATION: &str = "chainHead_v1_stopOperation";
pub const TRANSACTION_BROADCAST: &str = "transaction_v1_broadcast";
pub const TRANSACTION_STOP: &str = "transaction_v1_stop";

pub const CHAIN_GET_HEADER: &str = "chain_getHeader";
pub const CHAIN_GET_FINALIZED_HEAD: &str = "chain_getFinalizedHead";
pub const CHAIN_GET_BLOCK_HASH: &str = "chain_getBlockHash";
pub const CHAIN_GET_BLOCK: &str = "chain_getBlock";
pub const CHAIN_SUBSCRIBE_NEW_HEADS: &str = "chain_subscribeNewHeads";
pub const CHAIN_UNSUBSCRIBE_NEW_HEADS: &str = "chain_unsubscribeNewHeads";
pub const CHAIN_NEW_HEAD: &str = "chain_newHead";
pub const CHAIN_SUBSCRIBE_FINALIZED_HEADS: &str = "chain_subscribeFinalizedHeads";
pub const CHAIN_UNSUBSCRIBE_FINALIZED_HEADS: &str = "chain_unsubscribeFinalizedHeads";
pub const CHAIN_FINALIZED_HEAD: &str = "chain_finalizedHead";
pub const STATE_GET_STORAGE: &str = "state_getStorage";
pub const STATE_SUBSCRIBE_STORAGE: &str = "state_subscribeStorage";
pub const STATE_UNSUBSCRIBE_STORAGE: &str = "state_unsubscribeStorage";
pub const STATE_STORAGE: &str = "state_storage";
pub const STATE_CALL: &str = "state_call";
pub const AUTHOR_SUBMIT_AND_WATCH_EXTRINSIC: &str = "author_submitAndWatchExtrinsic";
pub const AUTHOR_UNWATCH_EXTRINSIC: &str = "author_unwatchExtrinsic";
pub const AUTHOR_EXTRINSIC_UPDATE: &str = "author_extrinsicUpdate";

/// Arbitrary bytes, encoded in JSON as a `0x`-prefixed hexadecimal string.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HexString(pub Vec<u8>);

impl AsRef<[u8]> for HexString {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for HexString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(&self.0))
    }
}

impl serde::Serialize for HexString {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.to_string().serialize(serializer)
    }
}

impl<'a> serde::Deserialize<'a> for HexString {
    fn deserialize<D>(deserializer: D) -> Result<HexString, D::Error>
    where
        D: serde::Deserializer<'a>,
    {
        let string = <Cow<'a, str>>::deserialize(deserializer)?;
        decode_hex(&string)
            .map(HexString)
            .map_err(serde::de::Error::custom)
    }
}

/// A 32 bytes hash, encoded in JSON as a `0x`-prefixed hexadecimal string.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HashHexString(pub [u8; 32]);

impl fmt::Display for HashHexString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl serde::Serialize for HashHexString {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.to_string().serialize(serializer)
    }
}

impl<'a> serde::Deserialize<'a> for HashHexString {
    fn deserialize<D>(deserializer: D) -> Result<HashHexString, D::Error>
    where
        D: serde::Deserializer<'a>,
    {
        let string = <Cow<'a, str>>::deserialize(deserializer)?;
        let bytes = decode_hex(&string).map_err(serde::de::Error::custom)?;
        <[u8; 32]>::try_from(bytes)
            .map(HashHexString)
            .map_err(|_| serde::de::Error::invalid_length(string.len(), &"a 32 bytes hash"))
    }
}

fn decode_hex(string: &str) -> Result<Vec<u8>, String> {
    let Some(hex) = string.strip_prefix("0x") else {
        return Err("hexadecimal string doesn't start with 0x".to_string());
    };
    hex::decode(hex).map_err(|err| err.to_string())
}

/// Event generated by a `chainHead_v1_follow` subscription.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "event")]
pub enum FollowEvent {
    #[serde(rename = "initialized")]
    Initialized {
        /// List of finalized blocks, from the oldest to the newest. Each block is the parent of
        /// the next one.
        ///
        /// Older servers report a single `finalizedBlockHash`, which is accepted as well.
        #[serde(
            rename = "finalizedBlockHashes",
            alias = "finalizedBlockHash",
            deserialize_with = "deserialize_one_or_many"
        )]
        finalized_block_hashes: Vec<HashHexString>,
        #[serde(
            rename = "finalizedBlockRuntime",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        finalized_block_runtime: Option<MaybeRuntimeSpec>,
    },
    #[serde(rename = "newBlock")]
    NewBlock {
        #[serde(rename = "blockHash")]
        block_hash: HashHexString,
        #[serde(rename = "parentBlockHash")]
        parent_block_hash: HashHexString,
        #[serde(rename = "newRuntime", default, skip_serializing_if = "Option::is_none")]
        new_runtime: Option<MaybeRuntimeSpec>,
    },
    #[serde(rename = "bestBlockChanged")]
    BestBlockChanged {
        #[serde(rename = "bestBlockHash")]
        best_block_hash: HashHexString,
    },
    #[serde(rename = "finalized")]
    Finalized {
        #[serde(rename = "finalizedBlockHashes")]
        finalized_blocks_hashes: Vec<HashHexString>,
        #[serde(rename = "prunedBlockHashes", default)]
        pruned_blocks_hashes: Vec<HashHexString>,
    },
    #[serde(rename = "operationBodyDone")]
    OperationBodyDone {
        #[serde(rename = "operationId")]
        operation_id: String,
        value: Vec<HexString>,
    },
    #[serde(rename = "operationCallDone")]
    OperationCallDone {
        #[serde(rename = "operationId")]
        operation_id: String,
        output: HexString,
    },
    #[serde(rename = "operationInaccessible")]
    OperationInaccessible {
        #[serde(rename = "operationId")]
        operation_id: String,
    },
    #[serde(rename = "operationStorageItems")]
    OperationStorageItems {
        #[serde(rename = "operationId")]
        operation_id: String,
        items: Vec<StorageResultItem>,
    },
    #[serde(rename = "operationStorageDone")]
    OperationStorageDone {
        #[serde(rename = "operationId")]
        operation_id: String,
    },
    #[serde(rename = "operationWaitingForContinue")]
    OperationWaitingForContinue {
        #[serde(rename = "operationId")]
        operation_id: String,
    },
    #[serde(rename = "operationError")]
    OperationError {
        #[serde(rename = "operationId")]
        operation_id: String,
        error: String,
    },
    #[serde(rename = "stop")]
    Stop {},
}

impl FollowEvent {
    /// Returns the identifier of the operation the event relates to, if this is an `operation*`
    /// event.
    pub fn operation_id(&self) -> Option<&str> {
        match self {
            FollowEvent::OperationBodyDone { operation_id, .. }
            | FollowEvent::OperationCallDone { operation_id, .. }
            | FollowEvent::OperationInaccessible { operation_id }
            | FollowEvent::OperationStorageItems { operation_id, .. }
            | FollowEvent::OperationStorageDone { operation_id }
            | FollowEvent::OperationWaitingForContinue { operation_id }
            | FollowEvent::OperationError { operation_id, .. } => Some(operation_id),
            FollowEvent::Initialized { .. }
            | FollowEvent::NewBlock { .. }
            | FollowEvent::BestBlockChanged { .. }
            | FollowEvent::Finalized { .. }
            | FollowEvent::Stop {} => None,
        }
    }
}

fn deserialize_one_or_many<'a, D>(deserializer: D) -> Result<Vec<HashHexString>, D::Error>
where
    D: serde::Deserializer<'a>,
{
    #[derive(serde::Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(HashHexString),
        Many(Vec<HashHexString>),
    }

    match <OneOrMany as serde::Deserialize>::deserialize(deserializer)? {
        OneOrMany::One(hash) => Ok(Vec::from([hash])),
        OneOrMany::Many(hashes) if !hashes.is_empty() => Ok(hashes),
        OneOrMany::Many(_) => Err(serde::de::Error::invalid_length(
            0,
            &"at least one finalized block",
        )),
    }
}

/// Runtime reported by a follow event.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type")]
pub enum MaybeRuntimeSpec {
    #[serde(rename = "valid")]
    Valid { spec: RuntimeSpec },
    #[serde(rename = "invalid")]
    Invalid { error: String },
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct RuntimeSpec {
    #[serde(rename = "specName")]
    pub spec_name: String,
    #[serde(rename = "implName")]
    pub impl_name: String,
    #[serde(rename = "specVersion")]
    pub spec_version: u32,
    #[serde(rename = "implVersion")]
    pub impl_version: u32,
    #[serde(
        rename = "transactionVersion",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub transaction_version: Option<u32>,
    /// Runtime APIs supported by the runtime. Keys are the BLAKE2b-64 hash of the name of the
    /// API, and values the version.
    #[serde(default)]
    pub apis: BTreeMap<HexString, u32>,
}

/// Response to a `chainHead_v1_body`, `chainHead_v1_call` or `chainHead_v1_storage` request.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "result")]
pub enum MethodResponse {
    #[serde(rename = "started")]
    Started {
        #[serde(rename = "operationId")]
        operation_id: String,
        /// Number of items at the end of the request that the server has refused to process.
        /// Only ever present for storage requests.
        #[serde(
            rename = "discardedItems",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        discarded_items: Option<usize>,
    },
    #[serde(rename = "limitReached")]
    LimitReached {},
}

/// Item of a `chainHead_v1_storage` request.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct StorageQueryItem {
    pub key: HexString,
    #[serde(rename = "type")]
    pub ty: StorageQueryType,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum StorageQueryType {
    #[serde(rename = "value")]
    Value,
    #[serde(rename = "hash")]
    Hash,
    #[serde(rename = "closestDescendantMerkleValue")]
    ClosestDescendantMerkleValue,
    #[serde(rename = "descendantsValues")]
    DescendantsValues,
    #[serde(rename = "descendantsHashes")]
    DescendantsHashes,
}

/// Item reported by an `operationStorageItems` event.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct StorageResultItem {
    pub key: HexString,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<HexString>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<HexString>,
    #[serde(
        rename = "closestDescendantMerkleValue",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub closest_descendant_merkle_value: Option<HexString>,
}

/// Header of a block, as returned by the legacy JSON-RPC functions.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Header {
    #[serde(rename = "parentHash")]
    pub parent_hash: HashHexString,
    #[serde(
        serialize_with = "serialize_hex_number",
        deserialize_with = "deserialize_hex_number"
    )]
    pub number: u64,
    #[serde(rename = "stateRoot")]
    pub state_root: HashHexString,
    #[serde(rename = "extrinsicsRoot")]
    pub extrinsics_root: HashHexString,
    pub digest: HeaderDigest,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct HeaderDigest {
    /// SCALE-encoded digest items.
    pub logs: Vec<HexString>,
}

impl Header {
    /// Builds the SCALE encoding of this header.
    pub fn scale_encoding_vec(&self) -> Vec<u8> {
        let mut digest = util::encode_scale_compact_u64(self.digest.logs.len() as u64);
        for log in &self.digest.logs {
            digest.extend_from_slice(&log.0);
        }

        header::HeaderRef {
            parent_hash: &self.parent_hash.0,
            number: self.number,
            state_root: &self.state_root.0,
            extrinsics_root: &self.extrinsics_root.0,
            digest: &digest,
        }
        .scale_encoding_vec()
    }

    /// Returns the hash of the block this header belongs to.
    pub fn hash(&self) -> [u8; 32] {
        header::hash_from_scale_encoded_header(self.scale_encoding_vec())
    }
}

fn serialize_hex_number<S>(number: &u64, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serde::Serialize::serialize(&format!("0x{number:x}"), serializer)
}

fn deserialize_hex_number<'a, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: serde::Deserializer<'a>,
{
    #[derive(serde::Deserialize)]
    #[serde(untagged)]
    enum NumberOrHex<'a> {
        Number(u64),
        Hex(Cow<'a, str>),
    }

    match <NumberOrHex as serde::Deserialize>::deserialize(deserializer)? {
        NumberOrHex::Number(n) => Ok(n),
        NumberOrHex::Hex(string) => {
            let digits = string
                .strip_prefix("0x")
                .ok_or_else(|| serde::de::Error::custom("block number doesn't start with 0x"))?;
            u64::from_str_radix(digits, 16).map_err(serde::de::Error::custom)
        }
    }
}

/// Block returned by `chain_getBlock`.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SignedBlock {
    pub block: Block,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Block {
    pub header: Header,
    /// SCALE-encoded extrinsics of the block.
    pub extrinsics: Vec<HexString>,
}

/// Notification of a `state_subscribeStorage` subscription.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct StorageChangeSet {
    pub block: HashHexString,
    /// Keys whose value has changed, and their new value. `None` if the value has been removed.
    pub changes: Vec<(HexString, Option<HexString>)>,
}

/// Notification of an `author_submitAndWatchExtrinsic` subscription.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TransactionStatus {
    Future,
    Ready,
    Broadcast(Vec<String>),
    InBlock(HashHexString),
    Retracted(HashHexString),
    FinalityTimeout(HashHexString),
    Finalized(HashHexString),
    Usurped(HashHexString),
    Dropped,
    Invalid,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn follow_event_initialized_v1() {
        let event: FollowEvent = serde_json::from_str(
            r#"{"event":"initialized","finalizedBlockHashes":["0x0101010101010101010101010101010101010101010101010101010101010101","0x0202020202020202020202020202020202020202020202020202020202020202"]}"#,
        )
        .unwrap();
        assert_eq!(
            event,
            FollowEvent::Initialized {
                finalized_block_hashes: vec![HashHexString([1; 32]), HashHexString([2; 32])],
                finalized_block_runtime: None,
            }
        );
    }

    #[test]
    fn follow_event_initialized_single_hash() {
        let event: FollowEvent = serde_json::from_str(
            r#"{"event":"initialized","finalizedBlockHash":"0x0101010101010101010101010101010101010101010101010101010101010101"}"#,
        )
        .unwrap();
        assert!(matches!(
            event,
            FollowEvent::Initialized { finalized_block_hashes, .. } if finalized_block_hashes == [HashHexString([1; 32])]
        ));
    }

    #[test]
    fn follow_event_new_block_with_runtime() {
        let event: FollowEvent = serde_json::from_str(
            r#"{"event":"newBlock","blockHash":"0x0202020202020202020202020202020202020202020202020202020202020202","parentBlockHash":"0x0101010101010101010101010101010101010101010101010101010101010101","newRuntime":{"type":"valid","spec":{"specName":"polkadot","implName":"parity-polkadot","specVersion":1002000,"implVersion":0,"transactionVersion":26,"apis":{"0xdf6acb689907609b":5}}}}"#,
        )
        .unwrap();
        let FollowEvent::NewBlock {
            new_runtime: Some(MaybeRuntimeSpec::Valid { spec }),
            ..
        } = event
        else {
            panic!()
        };
        assert_eq!(spec.spec_version, 1002000);
        assert_eq!(
            spec.apis.get(&HexString(vec![0xdf, 0x6a, 0xcb, 0x68, 0x99, 0x07, 0x60, 0x9b])),
            Some(&5)
        );
    }

    #[test]
    fn follow_event_operation() {
        let event: FollowEvent = serde_json::from_str(
            r#"{"event":"operationStorageItems","operationId":"op1","items":[{"key":"0x01","value":"0x"}]}"#,
        )
        .unwrap();
        assert_eq!(event.operation_id(), Some("op1"));
        let FollowEvent::OperationStorageItems { items, .. } = event else {
            panic!()
        };
        assert_eq!(items[0].value, Some(HexString(Vec::new())));
    }

    #[test]
    fn follow_event_stop() {
        let event: FollowEvent = serde_json::from_str(r#"{"event":"stop"}"#).unwrap();
        assert_eq!(event, FollowEvent::Stop {});
        assert_eq!(serde_json::to_string(&event).unwrap(), r#"{"event":"stop"}"#);
    }

    #[test]
    fn method_response() {
        let response: MethodResponse =
            serde_json::from_str(r#"{"result":"started","operationId":"5","discardedItems":2}"#)
                .unwrap();
        assert_eq!(
            response,
            MethodResponse::Started {
                operation_id: "5".into(),
                discarded_items: Some(2)
            }
        );
        let response: MethodResponse =
            serde_json::from_str(r#"{"result":"limitReached"}"#).unwrap();
        assert_eq!(response, MethodResponse::LimitReached {});
    }

    #[test]
    fn storage_query_item_serialize() {
        let item = StorageQueryItem {
            key: HexString(vec![0xab]),
            ty: StorageQueryType::Value,
        };
        assert_eq!(
            serde_json::to_string(&item).unwrap(),
            r#"{"key":"0xab","type":"value"}"#
        );
    }

    #[test]
    fn hex_string_requires_prefix() {
        assert!(serde_json::from_str::<HexString>(r#""abcd""#).is_err());
        assert!(serde_json::from_str::<HashHexString>(r#""0xabcd""#).is_err());
    }

    #[test]
    fn legacy_header_hash() {
        let header: Header = serde_json::from_str(
            r#"{"parentHash":"0x0101010101010101010101010101010101010101010101010101010101010101","number":"0x45","stateRoot":"0x0202020202020202020202020202020202020202020202020202020202020202","extrinsicsRoot":"0x0303030303030303030303030303030303030303030303030303030303030303","digest":{"logs":[]}}"#,
        )
        .unwrap();
        assert_eq!(header.number, 0x45);

        let encoded = header.scale_encoding_vec();
        let decoded = crate::header::decode(&encoded).unwrap();
        assert_eq!(decoded.number, 0x45);
        assert_eq!(decoded.parent_hash, &[1; 32]);
        assert_eq!(header.hash(), crate::header::hash_from_scale_encoded_header(&encoded));
    }

    #[test]
    fn legacy_transaction_status() {
        let status: TransactionStatus = serde_json::from_str(r#""ready""#).unwrap();
        assert_eq!(status, TransactionStatus::Ready);
        let status: TransactionStatus = serde_json::from_str(
            r#"{"inBlock":"0x0101010101010101010101010101010101010101010101010101010101010101"}"#,
        )
        .unwrap();
        assert_eq!(status, TransactionStatus::InBlock(HashHexString([1; 32])));
    }
}
