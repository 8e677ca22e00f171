use proc_macro::TokenStream;
use proc_macro2::{Ident, Span, TokenStream as TokenStream2};
use proc_macro_crate::{FoundCrate, crate_name};
use quote::{format_ident, quote};
use syn::{Data, DeriveInput, Field, Fields, LitStr, parse_macro_input};

#[proc_macro_derive(FormModel, attributes(form))]
pub fn derive_form_model(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    match expand(input) {
        Ok(tokens) => tokens.into(),
        Err(error) => error.to_compile_error().into(),
    }
}

fn expand(input: DeriveInput) -> syn::Result<TokenStream2> {
    if !input.generics.params.is_empty() {
        return Err(syn::Error::new_spanned(
            input.ident,
            "FormModel derive currently supports only non-generic structs",
        ));
    }

    let model_ident = input.ident;
    let fields_struct_ident = format_ident!("{model_ident}Fields");

    let named_fields = match input.data {
        Data::Struct(data) => match data.fields {
            Fields::Named(fields) => fields.named,
            _ => {
                return Err(syn::Error::new(
                    Span::call_site(),
                    "FormModel derive requires a struct with named fields",
                ));
            }
        },
        _ => {
            return Err(syn::Error::new(
                Span::call_site(),
                "FormModel derive is only supported on structs",
            ));
        }
    };

    let calmform = calmform_path();
    let mut field_names = Vec::new();
    let mut fields_methods = Vec::new();
    let mut to_entries = Vec::new();
    let mut from_fields = Vec::new();

    for field in named_fields {
        let form_name = form_name(&field)?;
        let Some(field_ident) = field.ident else {
            continue;
        };
        let field_ty = field.ty;

        fields_methods.push(quote! {
            pub const fn #field_ident(&self) -> &'static str {
                #form_name
            }
        });
        to_entries.push(quote! {
            (
                #form_name,
                #calmform::value::FieldValue::to_form_value(&self.#field_ident),
            )
        });
        from_fields.push(quote! {
            #field_ident: <#field_ty as #calmform::value::FieldValue>::from_form_value(
                value.get(#form_name).unwrap_or(&null),
            )?
        });
        field_names.push(form_name);
    }

    Ok(quote! {
        #[derive(Clone, Copy, Debug, Default)]
        pub struct #fields_struct_ident;

        impl #fields_struct_ident {
            #(#fields_methods)*
        }

        impl #calmform::value::FormModel for #model_ident {
            type Fields = #fields_struct_ident;

            fn fields() -> Self::Fields {
                #fields_struct_ident
            }

            fn field_names() -> &'static [&'static str] {
                &[#(#field_names),*]
            }

            fn to_form_value(&self) -> #calmform::value::FormValue {
                #calmform::value::FormValue::from_entries([#(#to_entries),*])
            }

            fn from_form_value(value: &#calmform::value::FormValue) -> Option<Self> {
                value.as_map()?;
                let null = #calmform::value::FormValue::Null;
                Some(Self {
                    #(#from_fields),*
                })
            }
        }

        impl #calmform::value::FieldValue for #model_ident {
            fn to_form_value(&self) -> #calmform::value::FormValue {
                <Self as #calmform::value::FormModel>::to_form_value(self)
            }

            fn from_form_value(value: &#calmform::value::FormValue) -> Option<Self> {
                <Self as #calmform::value::FormModel>::from_form_value(value)
            }
        }
    })
}

/// Name of the field inside form paths: `#[form(rename = "...")]` or the
/// Rust identifier.
fn form_name(field: &Field) -> syn::Result<String> {
    let mut rename = None;
    for attr in field.attrs.iter().filter(|attr| attr.path().is_ident("form")) {
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("rename") {
                let value: LitStr = meta.value()?.parse()?;
                rename = Some(value.value());
                Ok(())
            } else {
                Err(meta.error("unsupported form attribute, expected `rename`"))
            }
        })?;
    }
    match (rename, &field.ident) {
        (Some(name), _) => Ok(name),
        (None, Some(ident)) => Ok(ident.to_string().trim_start_matches("r#").to_string()),
        (None, None) => Err(syn::Error::new_spanned(field, "expected a named field")),
    }
}

fn calmform_path() -> TokenStream2 {
    match crate_name("calmform") {
        Ok(FoundCrate::Name(name)) => {
            let ident = Ident::new(&name, Span::call_site());
            quote!(::#ident)
        }
        Ok(FoundCrate::Itself) => quote!(crate),
        Err(_) => quote!(::calmform),
    }
}
