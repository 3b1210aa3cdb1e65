//! Proc macros for retrieval tool definitions.
//!
//! Provides `#[derive(Tool)]`, which turns an argument struct into a
//! `claude::Tool` definition with a JSON input schema. Fields marked with
//! `#[tool(choices = "slot")]` get their `enum` values filled in when the tool
//! is built, so the schema can list ids that only exist at call time.
//!
//! # Example
//!
//! ```ignore
//! /// Fetch one memory page by id
//! #[derive(Tool, Deserialize)]
//! #[tool(name = "fetch_page")]
//! struct FetchPage {
//!     /// Id of the page to read
//!     #[tool(choices = "page_ids")]
//!     page_id: String,
//! }
//!
//! let mut choices = HashMap::new();
//! choices.insert("page_ids", vec!["p-1".to_string(), "p-2".to_string()]);
//! let tool = FetchPage::as_tool_with(&choices);
//! ```

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{parse_macro_input, Attribute, DeriveInput, Expr, Field, Lit, LitStr, Meta, Type};

/// Derive macro for generating Tool implementations.
///
/// # Attributes
///
/// - `#[tool(name = "...")]` on the struct: override the tool name (defaults to snake_case)
/// - `#[tool(optional)]` on fields: not listed in `required`
/// - `#[tool(rename = "...")]` on fields: override the property name
/// - `#[tool(choices = "...")]` on fields: enum values come from this slot at build time
#[proc_macro_derive(Tool, attributes(tool))]
pub fn derive_tool(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    expand_tool(input)
        .unwrap_or_else(|err| err.to_compile_error())
        .into()
}

#[derive(Default)]
struct FieldAttrs {
    optional: bool,
    rename: Option<String>,
    choices: Option<String>,
}

fn expand_tool(input: DeriveInput) -> syn::Result<TokenStream2> {
    let struct_name = &input.ident;
    let tool_name = get_tool_name(&input)?;
    let description = get_doc_comment(&input.attrs);

    let fields = match &input.data {
        syn::Data::Struct(data) => match &data.fields {
            syn::Fields::Named(named) => &named.named,
            _ => {
                return Err(syn::Error::new_spanned(
                    &input,
                    "Tool derive only supports structs with named fields",
                ))
            }
        },
        _ => {
            return Err(syn::Error::new_spanned(
                &input,
                "Tool derive only supports structs",
            ))
        }
    };

    let mut property_tokens = Vec::new();
    let mut required_fields = Vec::new();
    let mut slot_names = Vec::new();

    for field in fields {
        let attrs = parse_field_attrs(field)?;
        let field_name = match (&attrs.rename, &field.ident) {
            (Some(rename), _) => rename.clone(),
            (None, Some(ident)) => ident.to_string(),
            (None, None) => {
                return Err(syn::Error::new_spanned(field, "Tool fields must be named"))
            }
        };
        let field_desc = get_doc_comment(&field.attrs);
        let type_schema = type_to_schema(&field.ty);

        let desc_token = if field_desc.is_empty() {
            quote! {}
        } else {
            quote! { property["description"] = serde_json::json!(#field_desc); }
        };

        let choices_token = match &attrs.choices {
            Some(slot) => {
                slot_names.push(slot.clone());
                let is_array = is_vec_type(&field.ty);
                quote! {
                    if let Some(values) = choices.get(#slot).filter(|v| !v.is_empty()) {
                        if #is_array {
                            property["items"]["enum"] = serde_json::json!(values);
                        } else {
                            property["enum"] = serde_json::json!(values);
                        }
                    }
                }
            }
            None => quote! {},
        };

        property_tokens.push(quote! {
            {
                #[allow(unused_mut)]
                let mut property = #type_schema;
                #desc_token
                #choices_token
                properties.insert(#field_name.to_string(), property);
            }
        });

        if !attrs.optional && !is_option_type(&field.ty) {
            required_fields.push(field_name);
        }
    }

    Ok(quote! {
        impl #struct_name {
            /// Get the tool name.
            pub fn tool_name() -> &'static str {
                #tool_name
            }

            /// Get the tool description.
            pub fn tool_description() -> &'static str {
                #description
            }

            /// Names of the choice slots this tool reads.
            pub fn choice_slots() -> &'static [&'static str] {
                &[#(#slot_names),*]
            }

            /// JSON schema with `enum` values taken from `choices`.
            pub fn input_schema_with(
                choices: &std::collections::HashMap<&str, Vec<String>>,
            ) -> serde_json::Value {
                let _ = choices;
                let mut properties = serde_json::Map::new();
                #(#property_tokens)*

                let required: Vec<&str> = vec![#(#required_fields),*];

                serde_json::json!({
                    "type": "object",
                    "properties": properties,
                    "required": required
                })
            }

            /// JSON schema without enumerated values.
            pub fn input_schema() -> serde_json::Value {
                Self::input_schema_with(&std::collections::HashMap::new())
            }

            /// Build the tool definition with live enum values.
            pub fn as_tool_with(
                choices: &std::collections::HashMap<&str, Vec<String>>,
            ) -> claude::Tool {
                claude::Tool {
                    name: Self::tool_name().to_string(),
                    description: Self::tool_description().to_string(),
                    input_schema: Self::input_schema_with(choices),
                }
            }

            pub fn as_tool() -> claude::Tool {
                Self::as_tool_with(&std::collections::HashMap::new())
            }
        }
    })
}

fn get_tool_name(input: &DeriveInput) -> syn::Result<String> {
    let mut name = None;
    for attr in input.attrs.iter().filter(|a| a.path().is_ident("tool")) {
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("name") {
                let value: LitStr = meta.value()?.parse()?;
                name = Some(value.value());
                Ok(())
            } else {
                Err(meta.error("unsupported tool attribute"))
            }
        })?;
    }
    Ok(name.unwrap_or_else(|| to_snake_case(&input.ident.to_string())))
}

fn parse_field_attrs(field: &Field) -> syn::Result<FieldAttrs> {
    let mut attrs = FieldAttrs::default();
    for attr in field.attrs.iter().filter(|a| a.path().is_ident("tool")) {
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("optional") {
                attrs.optional = true;
            } else if meta.path.is_ident("rename") {
                let value: LitStr = meta.value()?.parse()?;
                attrs.rename = Some(value.value());
            } else if meta.path.is_ident("choices") {
                let value: LitStr = meta.value()?.parse()?;
                attrs.choices = Some(value.value());
            } else {
                return Err(meta.error("unsupported tool field attribute"));
            }
            Ok(())
        })?;
    }
    Ok(attrs)
}

fn get_doc_comment(attrs: &[Attribute]) -> String {
    let mut docs = Vec::new();
    for attr in attrs {
        if attr.path().is_ident("doc") {
            if let Meta::NameValue(nv) = &attr.meta {
                if let Expr::Lit(expr_lit) = &nv.value {
                    if let Lit::Str(s) = &expr_lit.lit {
                        docs.push(s.value().trim().to_string());
                    }
                }
            }
        }
    }
    docs.join(" ")
}

fn last_segment(ty: &Type) -> Option<&syn::PathSegment> {
    match ty {
        Type::Path(type_path) => type_path.path.segments.last(),
        _ => None,
    }
}

fn is_option_type(ty: &Type) -> bool {
    last_segment(ty).is_some_and(|s| s.ident == "Option")
}

fn is_vec_type(ty: &Type) -> bool {
    match last_segment(ty) {
        Some(segment) if segment.ident == "Option" => {
            inner_type(segment).is_some_and(is_vec_type)
        }
        Some(segment) => segment.ident == "Vec",
        None => false,
    }
}

fn inner_type(segment: &syn::PathSegment) -> Option<&Type> {
    if let syn::PathArguments::AngleBracketed(args) = &segment.arguments {
        if let Some(syn::GenericArgument::Type(inner)) = args.args.first() {
            return Some(inner);
        }
    }
    None
}

fn type_to_schema(ty: &Type) -> TokenStream2 {
    let Some(segment) = last_segment(ty) else {
        return quote! { serde_json::json!({}) };
    };

    match segment.ident.to_string().as_str() {
        "String" | "str" => quote! { serde_json::json!({"type": "string"}) },
        "i8" | "i16" | "i32" | "i64" | "isize" | "u8" | "u16" | "u32" | "u64" | "usize" => {
            quote! { serde_json::json!({"type": "integer"}) }
        }
        "f32" | "f64" => quote! { serde_json::json!({"type": "number"}) },
        "bool" => quote! { serde_json::json!({"type": "boolean"}) },
        "Option" => match inner_type(segment) {
            Some(inner) => type_to_schema(inner),
            None => quote! { serde_json::json!({}) },
        },
        "Vec" => match inner_type(segment) {
            Some(inner) => {
                let inner_schema = type_to_schema(inner);
                quote! {
                    serde_json::json!({
                        "type": "array",
                        "items": #inner_schema
                    })
                }
            }
            None => quote! { serde_json::json!({"type": "array"}) },
        },
        _ => quote! { serde_json::json!({"type": "object"}) },
    }
}

fn to_snake_case(s: &str) -> String {
    let mut result = String::new();
    for (i, c) in s.chars().enumerate() {
        if c.is_uppercase() {
            if i > 0 {
                result.push('_');
            }
            result.push(c.to_ascii_lowercase());
        } else {
            result.push(c);
        }
    }
    result
}
