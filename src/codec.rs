//! Borsh layout encoding driven by [`ProgramInterface`] schemas.

use std::collections::BTreeMap;
use std::fmt;

use borsh::{BorshDeserialize, BorshSerialize};
use solana_sdk::pubkey::Pubkey;

use crate::error::{HarnessError, HarnessResult};
use crate::idl::{
	account_discriminator, instruction_discriminator, FieldDef, FieldType, InstructionDef, ProgramInterface,
	TypeDefKind,
};

pub const DISCRIMINATOR_LEN: usize = 8;

/// A decoded (or to-be-encoded) field value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
	Bool(bool),
	Uint(u128),
	Int(i128),
	Float(f64),
	String(String),
	Bytes(Vec<u8>),
	PublicKey(Pubkey),
	Vec(Vec<Value>),
	Option(Option<Box<Value>>),
	Struct(BTreeMap<String, Value>),
	Enum { variant: String, fields: BTreeMap<String, Value> },
}

macro_rules! value_from {
	($variant:ident as $target:ty: $($t:ty),*) => {
		$(impl From<$t> for Value {
			fn from(v: $t) -> Self {
				Value::$variant(v as $target)
			}
		})*
	};
}

value_from!(Uint as u128: u8, u16, u32, u64, u128);
value_from!(Int as i128: i8, i16, i32, i64, i128);
value_from!(Float as f64: f32, f64);

impl From<bool> for Value {
	fn from(v: bool) -> Self {
		Value::Bool(v)
	}
}

impl From<&str> for Value {
	fn from(v: &str) -> Self {
		Value::String(v.to_string())
	}
}

impl From<String> for Value {
	fn from(v: String) -> Self {
		Value::String(v)
	}
}

impl From<Pubkey> for Value {
	fn from(v: Pubkey) -> Self {
		Value::PublicKey(v)
	}
}

impl From<Vec<Value>> for Value {
	fn from(v: Vec<Value>) -> Self {
		Value::Vec(v)
	}
}

impl<T: Into<Value>> From<Option<T>> for Value {
	fn from(v: Option<T>) -> Self {
		Value::Option(v.map(|inner| Box::new(inner.into())))
	}
}

impl Value {
	pub fn as_u64(&self) -> Option<u64> {
		match self {
			Value::Uint(v) => u64::try_from(*v).ok(),
			Value::Int(v) => u64::try_from(*v).ok(),
			_ => None,
		}
	}

	pub fn as_pubkey(&self) -> Option<Pubkey> {
		match self {
			Value::PublicKey(k) => Some(*k),
			_ => None,
		}
	}

	pub fn field(&self, name: &str) -> Option<&Value> {
		match self {
			Value::Struct(fields) | Value::Enum { fields, .. } => fields.get(name),
			_ => None,
		}
	}

	/// Resolves a path such as `bidsList[0].detailsList[1].bidAmount`.
	pub fn get_path(&self, path: &str) -> Option<&Value> {
		let mut current = self;
		for segment in path.split('.').filter(|s| !s.is_empty()) {
			let (name, indices) = match segment.find('[') {
				Some(pos) => (&segment[..pos], &segment[pos..]),
				None => (segment, ""),
			};
			if !name.is_empty() {
				current = current.field(name)?;
			}
			for index in indices.split('[').filter(|s| !s.is_empty()) {
				let index: usize = index.strip_suffix(']')?.parse().ok()?;
				current = match current {
					Value::Vec(items) => items.get(index)?,
					_ => return None,
				};
			}
		}
		Some(current)
	}

	/// Structural equality that treats `Uint(5)` and `Int(5)` as the same
	/// number, so expectations need not spell out signedness.
	pub fn matches(&self, other: &Value) -> bool {
		match (self, other) {
			(Value::Uint(a), Value::Int(b)) | (Value::Int(b), Value::Uint(a)) => {
				u128::try_from(*b).map(|b| b == *a).unwrap_or(false)
			}
			(Value::Vec(a), Value::Vec(b)) => a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.matches(y)),
			(Value::Option(Some(a)), Value::Option(Some(b))) => a.matches(b),
			(Value::Struct(a), Value::Struct(b)) => {
				a.len() == b.len() && a.iter().all(|(k, v)| b.get(k).map(|w| v.matches(w)).unwrap_or(false))
			}
			(
				Value::Enum { variant: va, fields: fa },
				Value::Enum { variant: vb, fields: fb },
			) => va == vb && Value::Struct(fa.clone()).matches(&Value::Struct(fb.clone())),
			_ => self == other,
		}
	}
}

impl fmt::Display for Value {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Value::Bool(v) => write!(f, "{v}"),
			Value::Uint(v) => write!(f, "{v}"),
			Value::Int(v) => write!(f, "{v}"),
			Value::Float(v) => write!(f, "{v}"),
			Value::String(v) => write!(f, "{v:?}"),
			Value::Bytes(v) => write!(f, "{v:?}"),
			Value::PublicKey(v) => write!(f, "{v}"),
			Value::Vec(items) => {
				write!(f, "[")?;
				for (i, item) in items.iter().enumerate() {
					if i > 0 {
						write!(f, ", ")?;
					}
					write!(f, "{item}")?;
				}
				write!(f, "]")
			}
			Value::Option(None) => write!(f, "null"),
			Value::Option(Some(v)) => write!(f, "{v}"),
			Value::Struct(fields) => write_fields(f, fields),
			Value::Enum { variant, fields } if fields.is_empty() => write!(f, "{variant}"),
			Value::Enum { variant, fields } => {
				write!(f, "{variant}")?;
				write_fields(f, fields)
			}
		}
	}
}

fn write_fields(f: &mut fmt::Formatter<'_>, fields: &BTreeMap<String, Value>) -> fmt::Result {
	write!(f, "{{")?;
	for (i, (k, v)) in fields.iter().enumerate() {
		if i > 0 {
			write!(f, ", ")?;
		}
		write!(f, "{k}: {v}")?;
	}
	write!(f, "}}")
}

/// Anchor instruction data: 8-byte discriminator followed by the arguments
/// in declaration order. `args` are matched to the declaration by name.
pub fn encode_instruction_data(
	iface: &ProgramInterface,
	ix: &InstructionDef,
	args: &[(&str, Value)],
) -> HarnessResult<Vec<u8>> {
	for (name, _) in args {
		if !ix.args.iter().any(|a| a.name == *name) {
			return Err(HarnessError::malformed(format!("{} takes no argument {name}", ix.name)));
		}
	}
	let mut out = instruction_discriminator(&ix.name).to_vec();
	for def in &ix.args {
		let value = args
			.iter()
			.find(|(name, _)| *name == def.name)
			.map(|(_, v)| v)
			.ok_or_else(|| HarnessError::malformed(format!("{} is missing argument {}", ix.name, def.name)))?;
		encode_value(iface, &def.ty, value, &mut out).map_err(|e| prefix_error(&def.name, e))?;
	}
	Ok(out)
}

/// Serializes an account the way Anchor lays it out on chain.
pub fn encode_account(iface: &ProgramInterface, type_name: &str, value: &Value) -> HarnessResult<Vec<u8>> {
	iface.account_type(type_name)?;
	let mut out = account_discriminator(type_name).to_vec();
	encode_value(iface, &FieldType::Defined(type_name.to_string()), value, &mut out)?;
	Ok(out)
}

pub fn decode_account(iface: &ProgramInterface, type_name: &str, data: &[u8]) -> HarnessResult<Value> {
	iface.account_type(type_name)?;
	if data.len() < DISCRIMINATOR_LEN {
		return Err(HarnessError::schema(
			format!("{type_name}: {} bytes is shorter than the discriminator", data.len()),
			data,
		));
	}
	if data[..DISCRIMINATOR_LEN] != account_discriminator(type_name) {
		return Err(HarnessError::schema(format!("{type_name}: discriminator mismatch"), data));
	}
	let mut decoder = Decoder { iface, raw: data, rest: &data[DISCRIMINATOR_LEN..] };
	let value = decoder.value(&FieldType::Defined(type_name.to_string()), type_name)?;
	// accounts are allocated larger than their contents; the slack must be zeroed
	if let Some(pos) = decoder.rest.iter().position(|b| *b != 0) {
		let offset = decoder.offset() + pos;
		return Err(HarnessError::schema(format!("{type_name}: non-zero trailing byte at offset {offset}"), data));
	}
	Ok(value)
}

fn prefix_error(field: &str, err: HarnessError) -> HarnessError {
	match err {
		HarnessError::MalformedInstruction(msg) => HarnessError::MalformedInstruction(format!("{field}: {msg}")),
		other => other,
	}
}

fn mismatch(ty: &FieldType, value: &Value) -> HarnessError {
	HarnessError::malformed(format!("expected {ty:?}, got {value}"))
}

fn put<T: BorshSerialize>(v: &T, out: &mut Vec<u8>) -> HarnessResult<()> {
	v.serialize(out).map_err(|e| HarnessError::malformed(e.to_string()))
}

macro_rules! put_int {
	($t:ty, $ty:expr, $value:expr, $out:expr) => {{
		let n = match $value {
			Value::Uint(n) => <$t>::try_from(*n).ok(),
			Value::Int(n) => <$t>::try_from(*n).ok(),
			_ => None,
		}
		.ok_or_else(|| mismatch($ty, $value))?;
		put(&n, $out)
	}};
}

pub fn encode_value(iface: &ProgramInterface, ty: &FieldType, value: &Value, out: &mut Vec<u8>) -> HarnessResult<()> {
	match (ty, value) {
		(FieldType::Bool, Value::Bool(b)) => put(b, out),
		(FieldType::U8, _) => put_int!(u8, ty, value, out),
		(FieldType::I8, _) => put_int!(i8, ty, value, out),
		(FieldType::U16, _) => put_int!(u16, ty, value, out),
		(FieldType::I16, _) => put_int!(i16, ty, value, out),
		(FieldType::U32, _) => put_int!(u32, ty, value, out),
		(FieldType::I32, _) => put_int!(i32, ty, value, out),
		(FieldType::U64, _) => put_int!(u64, ty, value, out),
		(FieldType::I64, _) => put_int!(i64, ty, value, out),
		(FieldType::U128, _) => put_int!(u128, ty, value, out),
		(FieldType::I128, _) => put_int!(i128, ty, value, out),
		(FieldType::F32, Value::Float(f)) => put(&(*f as f32), out),
		(FieldType::F64, Value::Float(f)) => put(f, out),
		(FieldType::String, Value::String(s)) => put(s, out),
		(FieldType::Bytes, Value::Bytes(b)) => put(b, out),
		(FieldType::PublicKey, Value::PublicKey(k)) => {
			out.extend_from_slice(k.as_ref());
			Ok(())
		}
		(FieldType::Vec(inner), Value::Vec(items)) => {
			let len = u32::try_from(items.len()).map_err(|_| HarnessError::malformed("vector too long"))?;
			put(&len, out)?;
			items.iter().try_for_each(|item| encode_value(iface, inner, item, out))
		}
		(FieldType::Array(inner, len), Value::Vec(items)) => {
			if items.len() != *len {
				return Err(HarnessError::malformed(format!("array needs {len} elements, got {}", items.len())));
			}
			items.iter().try_for_each(|item| encode_value(iface, inner, item, out))
		}
		(FieldType::Option(_), Value::Option(None)) => put(&0u8, out),
		(FieldType::Option(inner), Value::Option(Some(v))) => {
			put(&1u8, out)?;
			encode_value(iface, inner, v, out)
		}
		(FieldType::Defined(name), _) => encode_defined(iface, name, value, out),
		_ => Err(mismatch(ty, value)),
	}
}

fn encode_defined(iface: &ProgramInterface, name: &str, value: &Value, out: &mut Vec<u8>) -> HarnessResult<()> {
	let def = iface.type_def(name).map_err(|e| HarnessError::malformed(e.to_string()))?;
	match (&def.kind, value) {
		(TypeDefKind::Struct { fields: defs }, Value::Struct(fields)) => encode_fields(iface, name, defs, fields, out),
		(TypeDefKind::Enum { variants }, Value::Enum { variant, fields }) => {
			let index = variants
				.iter()
				.position(|v| v.name == *variant)
				.ok_or_else(|| HarnessError::malformed(format!("{name} has no variant {variant}")))?;
			put(&(index as u8), out)?;
			encode_fields(iface, name, &variants[index].fields, fields, out)
		}
		_ => Err(HarnessError::malformed(format!("value {value} does not fit type {name}"))),
	}
}

fn encode_fields(
	iface: &ProgramInterface,
	owner: &str,
	defs: &[FieldDef],
	fields: &BTreeMap<String, Value>,
	out: &mut Vec<u8>,
) -> HarnessResult<()> {
	for def in defs {
		let v = fields
			.get(&def.name)
			.ok_or_else(|| HarnessError::malformed(format!("{owner} is missing field {}", def.name)))?;
		encode_value(iface, &def.ty, v, out).map_err(|e| prefix_error(&def.name, e))?;
	}
	Ok(())
}

struct Decoder<'a> {
	iface: &'a ProgramInterface,
	raw: &'a [u8],
	rest: &'a [u8],
}

impl<'a> Decoder<'a> {
	fn offset(&self) -> usize {
		self.raw.len() - self.rest.len()
	}

	fn read<T: BorshDeserialize>(&mut self, path: &str) -> HarnessResult<T> {
		let offset = self.offset();
		T::deserialize(&mut self.rest)
			.map_err(|e| HarnessError::schema(format!("{path} at offset {offset}: {e}"), self.raw))
	}

	fn value(&mut self, ty: &FieldType, path: &str) -> HarnessResult<Value> {
		Ok(match ty {
			FieldType::Bool => Value::Bool(self.read(path)?),
			FieldType::U8 => Value::from(self.read::<u8>(path)?),
			FieldType::I8 => Value::from(self.read::<i8>(path)?),
			FieldType::U16 => Value::from(self.read::<u16>(path)?),
			FieldType::I16 => Value::from(self.read::<i16>(path)?),
			FieldType::U32 => Value::from(self.read::<u32>(path)?),
			FieldType::I32 => Value::from(self.read::<i32>(path)?),
			FieldType::U64 => Value::from(self.read::<u64>(path)?),
			FieldType::I64 => Value::from(self.read::<i64>(path)?),
			FieldType::U128 => Value::from(self.read::<u128>(path)?),
			FieldType::I128 => Value::from(self.read::<i128>(path)?),
			FieldType::F32 => Value::from(self.read::<f32>(path)?),
			FieldType::F64 => Value::from(self.read::<f64>(path)?),
			FieldType::String => Value::String(self.read(path)?),
			FieldType::Bytes => Value::Bytes(self.read(path)?),
			FieldType::PublicKey => Value::PublicKey(Pubkey::new_from_array(self.read::<[u8; 32]>(path)?)),
			FieldType::Vec(inner) => {
				let offset = self.offset();
				let len = self.read::<u32>(path)? as usize;
				if len > self.rest.len() {
					return Err(HarnessError::schema(
						format!("{path} at offset {offset}: length {len} exceeds remaining {} bytes", self.rest.len()),
						self.raw,
					));
				}
				let mut items = Vec::with_capacity(len);
				for i in 0..len {
					items.push(self.value(inner, &format!("{path}[{i}]"))?);
				}
				Value::Vec(items)
			}
			FieldType::Array(inner, len) => {
				let mut items = Vec::with_capacity(*len);
				for i in 0..*len {
					items.push(self.value(inner, &format!("{path}[{i}]"))?);
				}
				Value::Vec(items)
			}
			FieldType::Option(inner) => {
				let offset = self.offset();
				match self.read::<u8>(path)? {
					0 => Value::Option(None),
					1 => Value::Option(Some(Box::new(self.value(inner, path)?))),
					tag => {
						return Err(HarnessError::schema(
							format!("{path} at offset {offset}: invalid option tag {tag}"),
							self.raw,
						))
					}
				}
			}
			FieldType::Defined(name) => self.defined(name, path)?,
		})
	}

	fn defined(&mut self, name: &str, path: &str) -> HarnessResult<Value> {
		let iface = self.iface;
		let def = iface.type_def(name)?;
		match &def.kind {
			TypeDefKind::Struct { fields } => Ok(Value::Struct(self.fields(fields, path)?)),
			TypeDefKind::Enum { variants } => {
				let offset = self.offset();
				let tag = self.read::<u8>(path)? as usize;
				let variant = variants.get(tag).ok_or_else(|| {
					HarnessError::schema(format!("{path} at offset {offset}: {name} has no variant {tag}"), self.raw)
				})?;
				Ok(Value::Enum { variant: variant.name.clone(), fields: self.fields(&variant.fields, path)? })
			}
		}
	}

	fn fields(&mut self, defs: &[FieldDef], path: &str) -> HarnessResult<BTreeMap<String, Value>> {
		let mut out = BTreeMap::new();
		for def in defs {
			let child = if path.is_empty() { def.name.clone() } else { format!("{path}.{}", def.name) };
			out.insert(def.name.clone(), self.value(&def.ty, &child)?);
		}
		Ok(out)
	}
}
