mod test_support;

use serde_json::json;
use std::io::BufReader;
use std::process::{ChildStdin, ChildStdout};
use test_support::{request_err, request_ok, spawn_sidecar, str_field, temp_dir};

struct Seed {
    student_id: String,
    cs_subject_id: String,
    me_subject_id: String,
    mid_id: String,
    final_id: String,
    quiz_id: String,
}

fn seed(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>) -> Seed {
    let student_id = str_field(
        &request_ok(
            stdin,
            reader,
            "s1",
            "students.create",
            json!({
                "studentNo": "CS-100",
                "name": "Meera Nair",
                "department": "CS",
                "dateOfBirth": "2004-02-29"
            }),
        ),
        "studentId",
    );
    let cs_subject_id = str_field(
        &request_ok(
            stdin,
            reader,
            "sub1",
            "subjects.create",
            json!({ "subjectCode": "CS201", "subjectName": "Data Structures", "department": "CS", "semester": 3 }),
        ),
        "subjectId",
    );
    let me_subject_id = str_field(
        &request_ok(
            stdin,
            reader,
            "sub2",
            "subjects.create",
            json!({ "subjectCode": "ME101", "subjectName": "Statics", "department": "ME" }),
        ),
        "subjectId",
    );
    let mut exam = |id: &str, name: &str, max: f64, weight: f64| {
        str_field(
            &request_ok(
                &mut *stdin,
                &mut *reader,
                id,
                "exams.create",
                json!({ "examName": name, "maxMark": max, "weight": weight }),
            ),
            "examId",
        )
    };
    let mid_id = exam("e1", "Mid Term", 50.0, 50.0);
    let final_id = exam("e2", "Final", 50.0, 50.0);
    let quiz_id = exam("e3", "Quiz", 10.0, 20.0);
    Seed {
        student_id,
        cs_subject_id,
        me_subject_id,
        mid_id,
        final_id,
        quiz_id,
    }
}

fn mark(seed: &Seed, subject_id: &str, exam_id: &str, marks: f64) -> serde_json::Value {
    json!({
        "studentId": seed.student_id,
        "subjectId": subject_id,
        "examId": exam_id,
        "marksObtained": marks,
        "examDate": "05-03-2025",
        "semester": 3,
        "year": 2025
    })
}

#[test]
fn marks_enforce_department_range_uniqueness_and_weight() {
    let workspace = temp_dir("portald-term-marks");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let s = seed(&mut stdin, &mut reader);

    let mid_mark = request_ok(
        &mut stdin,
        &mut reader,
        "m1",
        "marks.create",
        mark(&s, &s.cs_subject_id, &s.mid_id, 40.0),
    );
    let mid_mark_id = str_field(&mid_mark, "markId");
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "m2",
        "marks.create",
        mark(&s, &s.cs_subject_id, &s.final_id, 44.5),
    );

    let (code, _) = request_err(
        &mut stdin,
        &mut reader,
        "m3",
        "marks.create",
        mark(&s, &s.cs_subject_id, &s.mid_id, 30.0),
    );
    assert_eq!(code, "conflict");

    let (code, error) = request_err(
        &mut stdin,
        &mut reader,
        "m4",
        "marks.create",
        mark(&s, &s.cs_subject_id, &s.quiz_id, 5.0),
    );
    assert_eq!(code, "weight_exceeded");
    assert_eq!(
        error["message"].as_str(),
        Some("Adding this mark would exceed 100% total weightage for this subject.")
    );

    let (code, _) = request_err(
        &mut stdin,
        &mut reader,
        "m5",
        "marks.create",
        mark(&s, &s.me_subject_id, &s.quiz_id, 5.0),
    );
    assert_eq!(code, "bad_params");

    let (code, _) = request_err(
        &mut stdin,
        &mut reader,
        "m6",
        "marks.update",
        json!({
            "id": mid_mark_id,
            "studentId": s.student_id,
            "subjectId": s.cs_subject_id,
            "examId": s.mid_id,
            "marksObtained": 51
        }),
    );
    assert_eq!(code, "bad_params");

    // Editing a mark in place must not count its own weight twice.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "m7",
        "marks.update",
        json!({
            "id": mid_mark_id,
            "studentId": s.student_id,
            "subjectId": s.cs_subject_id,
            "examId": s.mid_id,
            "marksObtained": 40,
            "examDate": "2025-03-06"
        }),
    );

    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "m8",
        "marks.list",
        json!({ "search": "meera" }),
    );
    assert_eq!(listed["marks"].as_array().map(|a| a.len()), Some(2));
}

#[test]
fn marks_report_grades_complete_subjects_only() {
    let workspace = temp_dir("portald-term-report");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let s = seed(&mut stdin, &mut reader);
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "m1",
        "marks.create",
        mark(&s, &s.cs_subject_id, &s.mid_id, 40.0),
    );

    let report = request_ok(
        &mut stdin,
        &mut reader,
        "r1",
        "marks.report",
        json!({ "studentId": s.student_id }),
    );
    let subject = &report["subjects"][0];
    assert_eq!(subject["subjectName"].as_str(), Some("Data Structures"));
    assert!(subject["grade"].is_null());
    assert_eq!(subject["result"].as_str(), Some("Incomplete"));
    assert_eq!(report["incompleteCount"].as_u64(), Some(1));

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "m2",
        "marks.create",
        mark(&s, &s.cs_subject_id, &s.final_id, 44.5),
    );
    let report = request_ok(
        &mut stdin,
        &mut reader,
        "r2",
        "marks.report",
        json!({ "studentId": s.student_id }),
    );
    let subject = &report["subjects"][0];
    assert_eq!(subject["normalizedTotal"].as_f64(), Some(84.5));
    assert_eq!(subject["totalWeight"].as_f64(), Some(100.0));
    assert_eq!(subject["grade"].as_str(), Some("B"));
    assert_eq!(subject["result"].as_str(), Some("Pass"));
    assert_eq!(subject["complete"].as_bool(), Some(true));
    assert_eq!(subject["components"].as_array().map(|a| a.len()), Some(2));
    assert_eq!(report["gradedCount"].as_u64(), Some(1));

    let (code, _) = request_err(
        &mut stdin,
        &mut reader,
        "r3",
        "marks.report",
        json!({ "studentId": "missing" }),
    );
    assert_eq!(code, "not_found");
}

#[test]
fn exam_updates_respect_recorded_marks() {
    let workspace = temp_dir("portald-term-exams");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let s = seed(&mut stdin, &mut reader);
    for (id, exam_id, marks) in [("m1", &s.mid_id, 40.0), ("m2", &s.final_id, 45.0)] {
        let _ = request_ok(
            &mut stdin,
            &mut reader,
            id,
            "marks.create",
            mark(&s, &s.cs_subject_id, exam_id, marks),
        );
    }

    let (code, _) = request_err(
        &mut stdin,
        &mut reader,
        "x1",
        "exams.create",
        json!({ "examName": "  mid term ", "maxMark": 50, "weight": 50 }),
    );
    assert_eq!(code, "conflict");

    let (code, _) = request_err(
        &mut stdin,
        &mut reader,
        "x2",
        "exams.update",
        json!({ "id": s.mid_id, "examName": "Mid Term", "maxMark": 50, "weight": 60 }),
    );
    assert_eq!(code, "weight_exceeded");

    let (code, _) = request_err(
        &mut stdin,
        &mut reader,
        "x3",
        "exams.update",
        json!({ "id": s.final_id, "examName": "Final", "maxMark": 40, "weight": 50 }),
    );
    assert_eq!(code, "bad_params");

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "x4",
        "exams.update",
        json!({ "id": s.mid_id, "examName": "Midterm", "maxMark": 60, "weight": 50 }),
    );

    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "x5",
        "exams.list",
        json!({ "sortBy": "maxMark", "sortOrder": "desc" }),
    );
    let labels: Vec<&str> = listed["exams"]
        .as_array()
        .expect("exams")
        .iter()
        .filter_map(|e| e["label"].as_str())
        .collect();
    assert_eq!(labels, vec!["Midterm(60,50)", "Final(50,50)", "Quiz(10,20)"]);

    let deleted = request_ok(
        &mut stdin,
        &mut reader,
        "x6",
        "exams.deleteMany",
        json!({ "ids": [s.mid_id, s.quiz_id] }),
    );
    assert_eq!(deleted["deleted"].as_u64(), Some(2));
    assert_eq!(deleted["marksRemoved"].as_u64(), Some(1));

    let marks = request_ok(
        &mut stdin,
        &mut reader,
        "x7",
        "marks.list",
        json!({ "studentId": s.student_id }),
    );
    assert_eq!(marks["marks"].as_array().map(|a| a.len()), Some(1));
}
