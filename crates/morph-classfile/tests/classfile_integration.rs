//! Integration tests for the class-file format and verifier

use morph_classfile::access::*;
use morph_classfile::{
    verify_class, ClassDef, ClassFile, ClassFileError, ClassWriter, CodeItem, FieldDef, Header,
    MemberRef, MethodDef, Opcode, VerifyOutcome, HEADER_SIZE,
};

fn returns(value: i32) -> CodeItem {
    let mut writer = ClassWriter::new();
    writer.emit_const(value);
    writer.emit_return();
    CodeItem::new(1, writer.into_bytes())
}

fn counter_class() -> ClassDef {
    let mut bump = ClassWriter::new();
    bump.emit_load_local(0);
    bump.emit_indexed(Opcode::GetField, 0);
    bump.emit_indexed(Opcode::InvokeStatic, 0);
    bump.emit_return();

    ClassDef::new("Lapp/Counter;", Some("Ljava/lang/Object;"))
        .with_interface("Lapp/Countable;")
        .with_field(FieldDef::new("count", "I", ACC_PRIVATE))
        .with_field(FieldDef::new("TOTAL", "J", ACC_STATIC | ACC_PRIVATE))
        .with_field_ref(MemberRef::new("Lapp/Counter;", "count", "I"))
        .with_method_ref(MemberRef::new("Lapp/Helper;", "inc", "(I)I"))
        .with_method(MethodDef::new(
            "<init>",
            "()V",
            ACC_PUBLIC | ACC_CONSTRUCTOR,
            Some(CodeItem::new(1, vec![Opcode::ReturnVoid.to_u8()])),
        ))
        .with_method(MethodDef::new("bump", "()I", ACC_PUBLIC, Some(CodeItem::new(1, bump.into_bytes()))))
        .with_method(MethodDef::new("limit", "()I", ACC_PUBLIC | ACC_STATIC, Some(returns(10))))
}

#[test]
fn test_encode_decode_preserves_definition() {
    let file = ClassFile::single(counter_class());
    let bytes = file.encode();
    assert!(bytes.len() > HEADER_SIZE);

    let decoded = ClassFile::decode(&bytes).expect("decode");
    assert_eq!(decoded.classes.len(), 1);
    let class = &decoded.classes[0];
    assert_eq!(class.descriptor, "Lapp/Counter;");
    assert_eq!(class.interfaces, vec!["Lapp/Countable;".to_string()]);
    assert_eq!(class.direct_method_count(), 2);
    assert_eq!(class.virtual_method_count(), 1);
}

#[test]
fn test_multi_class_file_decodes() {
    let file = ClassFile::new(vec![
        counter_class(),
        ClassDef::new("Lapp/Other;", Some("Ljava/lang/Object;")),
    ]);
    let bytes = file.encode();
    let header = Header::parse(&bytes).expect("header");
    assert_eq!(header.class_count, 2);
    assert_eq!(ClassFile::decode(&bytes).expect("decode").classes.len(), 2);
}

#[test]
fn test_encoding_is_deterministic() {
    let a = ClassFile::single(counter_class()).encode();
    let b = ClassFile::single(counter_class()).encode();
    assert_eq!(a, b);
}

#[test]
fn test_corrupted_body_is_rejected() {
    let mut bytes = ClassFile::single(counter_class()).encode();
    bytes[HEADER_SIZE + 2] ^= 0x55;
    assert!(matches!(
        ClassFile::decode(&bytes),
        Err(ClassFileError::ChecksumMismatch { .. })
    ));
}

#[test]
fn test_verifier_soft_fails_on_unloaded_helper() {
    let class = counter_class();
    let loaded = |descriptor: &str| descriptor != "Lapp/Helper;";
    assert_eq!(
        verify_class(&class, &loaded),
        VerifyOutcome::SoftFailure(vec!["Lapp/Helper;".to_string()])
    );

    let everything = |_: &str| true;
    assert_eq!(verify_class(&class, &everything), VerifyOutcome::NoFailure);
}

#[test]
fn test_verifier_rejects_bad_field_descriptor() {
    let class = counter_class().with_field(FieldDef::new("broken", "Q", 0));
    assert!(verify_class(&class, &|_: &str| true).is_hard_failure());
}
