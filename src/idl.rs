//! Program interface description.
//!
//! Parses the Anchor IDL JSON document emitted by `anchor build` (legacy 0.29
//! layout, with the 0.30 `{"defined": {"name": ..}}` form also accepted) into
//! fixed layout types. Nothing here is reflective: every instruction argument
//! and account field has an explicit [`FieldType`].

use std::collections::HashMap;
use std::str::FromStr;

use serde::Deserialize;
use sha2::{Digest, Sha256};
use solana_sdk::pubkey::Pubkey;

use crate::error::{HarnessError, HarnessResult};

const HELLO_ANCHOR_IDL: &str = include_str!("../idl/hello_anchor.json");

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "RawType")]
pub enum FieldType {
	Bool,
	U8,
	I8,
	U16,
	I16,
	U32,
	I32,
	U64,
	I64,
	U128,
	I128,
	F32,
	F64,
	String,
	Bytes,
	PublicKey,
	Vec(Box<FieldType>),
	Option(Box<FieldType>),
	Array(Box<FieldType>, usize),
	Defined(String),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawType {
	Named(String),
	Vec { vec: Box<RawType> },
	Option { option: Box<RawType> },
	Array { array: (Box<RawType>, usize) },
	Defined { defined: DefinedRef },
}

#[derive(Deserialize)]
#[serde(untagged)]
enum DefinedRef {
	Name(String),
	Object { name: String },
}

impl TryFrom<RawType> for FieldType {
	type Error = String;

	fn try_from(raw: RawType) -> Result<Self, Self::Error> {
		Ok(match raw {
			RawType::Named(name) => match name.as_str() {
				"bool" => FieldType::Bool,
				"u8" => FieldType::U8,
				"i8" => FieldType::I8,
				"u16" => FieldType::U16,
				"i16" => FieldType::I16,
				"u32" => FieldType::U32,
				"i32" => FieldType::I32,
				"u64" => FieldType::U64,
				"i64" => FieldType::I64,
				"u128" => FieldType::U128,
				"i128" => FieldType::I128,
				"f32" => FieldType::F32,
				"f64" => FieldType::F64,
				"string" => FieldType::String,
				"bytes" => FieldType::Bytes,
				"publicKey" | "pubkey" => FieldType::PublicKey,
				other => return Err(format!("unsupported idl type {other:?}")),
			},
			RawType::Vec { vec } => FieldType::Vec(Box::new(FieldType::try_from(*vec)?)),
			RawType::Option { option } => FieldType::Option(Box::new(FieldType::try_from(*option)?)),
			RawType::Array { array: (inner, len) } => FieldType::Array(Box::new(FieldType::try_from(*inner)?), len),
			RawType::Defined { defined: DefinedRef::Name(name) }
			| RawType::Defined { defined: DefinedRef::Object { name } } => FieldType::Defined(name),
		})
	}
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FieldDef {
	pub name: String,
	#[serde(rename = "type")]
	pub ty: FieldType,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct EnumVariant {
	pub name: String,
	#[serde(default)]
	pub fields: Vec<FieldDef>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TypeDefKind {
	Struct { fields: Vec<FieldDef> },
	Enum { variants: Vec<EnumVariant> },
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TypeDef {
	pub name: String,
	#[serde(rename = "type")]
	pub kind: TypeDefKind,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum SeedDef {
	Const { value: serde_json::Value },
	Account { path: String },
	Arg { path: String },
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PdaDef {
	pub seeds: Vec<SeedDef>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstructionAccount {
	pub name: String,
	#[serde(default)]
	pub is_mut: bool,
	#[serde(default)]
	pub is_signer: bool,
	#[serde(default)]
	pub pda: Option<PdaDef>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct InstructionDef {
	pub name: String,
	pub accounts: Vec<InstructionAccount>,
	#[serde(default)]
	pub args: Vec<FieldDef>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ErrorDef {
	pub code: u32,
	pub name: String,
	#[serde(default)]
	pub msg: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct Metadata {
	#[serde(default)]
	pub address: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ProgramInterface {
	pub name: String,
	#[serde(default)]
	pub version: Option<String>,
	pub instructions: Vec<InstructionDef>,
	#[serde(default)]
	pub accounts: Vec<TypeDef>,
	#[serde(default)]
	pub types: Vec<TypeDef>,
	#[serde(default)]
	pub errors: Vec<ErrorDef>,
	#[serde(default)]
	pub metadata: Metadata,
}

impl ProgramInterface {
	pub fn from_json_str(raw: &str) -> HarnessResult<Self> {
		serde_json::from_str(raw).map_err(|e| HarnessError::Config(format!("invalid program interface: {e}")))
	}

	pub fn from_path(path: &str) -> HarnessResult<Self> {
		let raw = std::fs::read_to_string(path).map_err(|e| HarnessError::Config(format!("read {path}: {e}")))?;
		Self::from_json_str(&raw)
	}

	/// The interface description of the `hello_anchor` program, as built.
	pub fn hello_anchor() -> HarnessResult<Self> {
		Self::from_json_str(HELLO_ANCHOR_IDL)
	}

	pub fn program_id(&self) -> HarnessResult<Pubkey> {
		let address = self
			.metadata
			.address
			.as_deref()
			.ok_or_else(|| HarnessError::Config(format!("interface {} has no program address", self.name)))?;
		Pubkey::from_str(address).map_err(|e| HarnessError::Config(format!("invalid program address {address}: {e}")))
	}

	/// Looks an instruction up by either its IDL (camelCase) or Rust
	/// (snake_case) name.
	pub fn instruction(&self, name: &str) -> HarnessResult<&InstructionDef> {
		let wanted = snake_case(name);
		self.instructions
			.iter()
			.find(|ix| snake_case(&ix.name) == wanted)
			.ok_or_else(|| HarnessError::malformed(format!("unknown instruction {name}")))
	}

	/// Account types first, then plain types.
	pub fn type_def(&self, name: &str) -> HarnessResult<&TypeDef> {
		self.accounts
			.iter()
			.chain(self.types.iter())
			.find(|t| t.name == name)
			.ok_or_else(|| HarnessError::Config(format!("type {name} not declared in interface {}", self.name)))
	}

	pub fn account_type(&self, name: &str) -> HarnessResult<&TypeDef> {
		self.accounts
			.iter()
			.find(|t| t.name == name)
			.ok_or_else(|| HarnessError::Config(format!("account type {name} not declared in interface {}", self.name)))
	}

	pub fn error(&self, code: u32) -> Option<&ErrorDef> {
		self.errors.iter().find(|e| e.code == code)
	}

	/// Derives the program address of a PDA account declared on an
	/// instruction. `Account` seeds are looked up in `known` by account name.
	pub fn pda(
		&self,
		instruction: &str,
		account: &str,
		known: &HashMap<String, Pubkey>,
	) -> HarnessResult<(Pubkey, u8)> {
		let program_id = self.program_id()?;
		let ix = self.instruction(instruction)?;
		let meta = ix
			.accounts
			.iter()
			.find(|a| a.name == account)
			.ok_or_else(|| HarnessError::malformed(format!("{} has no account {account}", ix.name)))?;
		let pda = meta
			.pda
			.as_ref()
			.ok_or_else(|| HarnessError::malformed(format!("{}.{account} is not a PDA", ix.name)))?;

		let mut seeds: Vec<Vec<u8>> = Vec::with_capacity(pda.seeds.len());
		for seed in &pda.seeds {
			match seed {
				SeedDef::Const { value } => seeds.push(const_seed_bytes(value)?),
				SeedDef::Account { path } => {
					let key = known
						.get(path)
						.ok_or_else(|| HarnessError::malformed(format!("seed account {path} not supplied")))?;
					seeds.push(key.to_bytes().to_vec());
				}
				SeedDef::Arg { path } => {
					return Err(HarnessError::malformed(format!("argument seed {path} is not supported")));
				}
			}
		}
		let refs: Vec<&[u8]> = seeds.iter().map(Vec::as_slice).collect();
		Ok(Pubkey::find_program_address(&refs, &program_id))
	}
}

fn const_seed_bytes(value: &serde_json::Value) -> HarnessResult<Vec<u8>> {
	match value {
		serde_json::Value::String(s) => Ok(s.as_bytes().to_vec()),
		serde_json::Value::Array(items) => items
			.iter()
			.map(|v| {
				v.as_u64()
					.and_then(|b| u8::try_from(b).ok())
					.ok_or_else(|| HarnessError::malformed(format!("invalid seed byte {v}")))
			})
			.collect(),
		other => Err(HarnessError::malformed(format!("unsupported const seed {other}"))),
	}
}

/// `addBid` -> `add_bid`.
pub fn snake_case(name: &str) -> String {
	let mut out = String::with_capacity(name.len() + 4);
	for (i, ch) in name.chars().enumerate() {
		if ch.is_ascii_uppercase() {
			if i > 0 {
				out.push('_');
			}
			out.push(ch.to_ascii_lowercase());
		} else {
			out.push(ch);
		}
	}
	out
}

fn discriminator(preimage: &str) -> [u8; 8] {
	let hash = Sha256::digest(preimage.as_bytes());
	let mut disc = [0u8; 8];
	disc.copy_from_slice(&hash[..8]);
	disc
}

pub fn instruction_discriminator(name: &str) -> [u8; 8] {
	discriminator(&format!("global:{}", snake_case(name)))
}

pub fn account_discriminator(name: &str) -> [u8; 8] {
	discriminator(&format!("account:{name}"))
}
